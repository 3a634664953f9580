//! Episode storage for recorded demonstrations.
//!
//! Frames are buffered in memory while an episode is recorded and written in
//! a single transaction when it is saved, so an aborted episode leaves
//! nothing behind.

use sqlx::SqlitePool;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use teleop_shared::codec::encode_jpeg;
use teleop_shared::{Command, Observation};

const DB_RETRIES: usize = 5;
const DB_RETRY_DELAY_MS: u64 = 50;

/// One recorded step: what was commanded and what the host reported.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp_ms: u64,
    pub action: Command,
    pub observation: Observation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeSummary {
    pub episode_index: i64,
    pub frames: usize,
}

pub trait EpisodeSink {
    fn add_frame(&mut self, frame: &Frame, task: &str) -> anyhow::Result<()>;
    /// Persist the buffered frames as one episode and start a new one.
    fn save_episode(&mut self) -> impl Future<Output = anyhow::Result<EpisodeSummary>> + Send;
    /// Finalise the dataset once recording is over.
    fn push(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

struct BufferedUnit {
    unit: String,
    action: String,
    state: String,
    applied: String,
    images: Vec<(String, Option<Vec<u8>>)>,
}

struct BufferedFrame {
    timestamp_ms: i64,
    task: String,
    units: Vec<BufferedUnit>,
}

pub struct SqliteDataset {
    pool: SqlitePool,
    jpeg_quality: u8,
    episode_index: i64,
    buffer: Vec<BufferedFrame>,
}

impl SqliteDataset {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path, jpeg_quality: u8) -> anyhow::Result<Self> {
        if !path.exists() {
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, b"")?;
            tracing::info!("Created empty dataset at {}", path.display());
        }
        let pool = SqlitePool::connect(&format!("sqlite://{}", path.display())).await?;
        Self::from_pool(pool, jpeg_quality).await
    }

    pub async fn from_pool(pool: SqlitePool, jpeg_quality: u8) -> anyhow::Result<Self> {
        create_tables(&pool).await?;
        let episode_index: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(episode_index) + 1, 0) FROM episodes")
                .fetch_one(&pool)
                .await?;
        Ok(Self {
            pool,
            jpeg_quality,
            episode_index,
            buffer: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }
}

async fn create_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            episode_index INTEGER PRIMARY KEY,
            num_frames    INTEGER NOT NULL,
            started_ms    INTEGER NOT NULL,
            ended_ms      INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS frames (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            episode_index INTEGER NOT NULL,
            frame_index   INTEGER NOT NULL,
            timestamp_ms  INTEGER NOT NULL,
            task          TEXT    NOT NULL,
            unit          TEXT    NOT NULL,
            action        TEXT    NOT NULL, -- JSON object, channel -> target
            state         TEXT    NOT NULL,
            applied       TEXT    NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            episode_index INTEGER NOT NULL,
            frame_index   INTEGER NOT NULL,
            unit          TEXT    NOT NULL,
            camera        TEXT    NOT NULL,
            jpeg          BLOB             -- NULL when the camera gave no frame
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn with_retry<T, F, Fut>(mut f: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay = DB_RETRY_DELAY_MS;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= DB_RETRIES => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!("dataset write failed ({e}), retry {attempt}/{DB_RETRIES}");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(1000);
            }
        }
    }
}

async fn write_episode(
    pool: &SqlitePool,
    episode_index: i64,
    frames: &[BufferedFrame],
) -> Result<(), sqlx::Error> {
    let started_ms = frames.first().map(|f| f.timestamp_ms).unwrap_or_default();
    let ended_ms = frames.last().map(|f| f.timestamp_ms).unwrap_or_default();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO episodes (episode_index, num_frames, started_ms, ended_ms) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(episode_index)
    .bind(frames.len() as i64)
    .bind(started_ms)
    .bind(ended_ms)
    .execute(&mut *tx)
    .await?;

    for (frame_index, frame) in frames.iter().enumerate() {
        let frame_index = frame_index as i64;
        for unit in &frame.units {
            sqlx::query(
                "INSERT INTO frames \
                 (episode_index, frame_index, timestamp_ms, task, unit, action, state, applied) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(episode_index)
            .bind(frame_index)
            .bind(frame.timestamp_ms)
            .bind(&frame.task)
            .bind(&unit.unit)
            .bind(&unit.action)
            .bind(&unit.state)
            .bind(&unit.applied)
            .execute(&mut *tx)
            .await?;

            for (camera, jpeg) in &unit.images {
                sqlx::query(
                    "INSERT INTO images (episode_index, frame_index, unit, camera, jpeg) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(episode_index)
                .bind(frame_index)
                .bind(&unit.unit)
                .bind(camera)
                .bind(jpeg.as_deref())
                .execute(&mut *tx)
                .await?;
            }
        }
    }
    tx.commit().await
}

impl EpisodeSink for SqliteDataset {
    fn add_frame(&mut self, frame: &Frame, task: &str) -> anyhow::Result<()> {
        let mut units = Vec::with_capacity(frame.observation.units.len());
        for (id, obs) in &frame.observation.units {
            let action = frame.action.action(id).cloned().unwrap_or_default();
            let mut images = Vec::with_capacity(obs.cameras.len());
            for (camera, image) in &obs.cameras {
                let jpeg = match image {
                    Some(img) => Some(encode_jpeg(img, self.jpeg_quality)?),
                    None => None,
                };
                images.push((camera.clone(), jpeg));
            }
            units.push(BufferedUnit {
                unit: id.to_string(),
                action: serde_json::to_string(&action)?,
                state: serde_json::to_string(&obs.state)?,
                applied: serde_json::to_string(&obs.applied)?,
                images,
            });
        }
        self.buffer.push(BufferedFrame {
            timestamp_ms: frame.timestamp_ms as i64,
            task: task.to_string(),
            units,
        });
        Ok(())
    }

    async fn save_episode(&mut self) -> anyhow::Result<EpisodeSummary> {
        let episode_index = self.episode_index;
        if self.buffer.is_empty() {
            tracing::warn!("episode {episode_index} has no frames, not saving it");
            return Ok(EpisodeSummary {
                episode_index,
                frames: 0,
            });
        }

        let pool = &self.pool;
        let frames = &self.buffer;
        with_retry(|| write_episode(pool, episode_index, frames)).await?;

        let summary = EpisodeSummary {
            episode_index,
            frames: self.buffer.len(),
        };
        self.buffer.clear();
        self.episode_index += 1;
        Ok(summary)
    }

    async fn push(&mut self) -> anyhow::Result<()> {
        if !self.buffer.is_empty() {
            tracing::warn!(
                "discarding {} frames of an unsaved episode",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        tracing::info!("Dataset finalised with {} episodes", self.episode_index);
        Ok(())
    }
}
