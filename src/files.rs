//! Downloaded and generated files kept on the device

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::Context;
use crate::error::{AppError, AppResult};
use crate::models::Record;
use crate::store::{self, Collection, now_rfc3339};

/// History entry for a saved file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    pub name: String,
    #[serde(default)]
    pub subdir: Option<String>,
    pub uri: String,
    pub size: u64,
    pub saved_at: String,
}

impl Record for SavedFile {
    fn record_id(&self) -> String {
        match &self.subdir {
            Some(subdir) => format!("{subdir}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct Downloads {
    root: PathBuf,
    client: reqwest::Client,
    ctx: Context,
}

impl Downloads {
    pub fn new(root: PathBuf, ctx: Context, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::File(format!("cliente HTTP: {e}")))?;
        Ok(Self { root, client, ctx })
    }

    /// Fetches `url` and stores the body as `filename`
    pub async fn download(&self, url: &str, filename: &str, subdir: Option<&str>) -> AppResult<SavedFile> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Validation("URL inválida".into()));
        }
        let dir = self.dir(subdir)?;
        check_name(filename)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::File(format!("Erro no download: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::File(format!("Erro no download: {}", status.as_u16())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::File(format!("Erro no download: {e}")))?;

        tracing::info!(url, filename, bytes = body.len(), "File downloaded");
        self.write(&dir, filename, subdir, &body).await
    }

    pub async fn save_bytes(&self, filename: &str, subdir: Option<&str>, data: &[u8]) -> AppResult<SavedFile> {
        let dir = self.dir(subdir)?;
        check_name(filename)?;
        self.write(&dir, filename, subdir, data).await
    }

    /// Files directly under the directory, sorted by name
    pub async fn list(&self, subdir: Option<&str>) -> AppResult<Vec<FileEntry>> {
        let dir = self.dir(subdir)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let metadata = entry.metadata().await.map_err(|e| io_error(&dir, e))?;
            if metadata.is_file() {
                files.push(FileEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub async fn delete(&self, filename: &str, subdir: Option<&str>) -> AppResult<()> {
        let dir = self.dir(subdir)?;
        check_name(filename)?;
        let path = dir.join(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::not_found("Arquivo", filename));
            }
            Err(e) => return Err(io_error(&path, e)),
        }

        let _guard = self.ctx.write()?;
        let id = record_key(filename, subdir);
        let mut history: Vec<SavedFile> = self.ctx.load(Collection::Downloads)?;
        history.retain(|f| f.record_id() != id);
        store::save_list(self.ctx.store.as_ref(), Collection::Downloads, &history)?;
        Ok(())
    }

    /// Saved-file history, newest first
    pub fn history(&self) -> AppResult<Vec<SavedFile>> {
        let mut history: Vec<SavedFile> = self.ctx.load(Collection::Downloads)?;
        history.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(history)
    }

    async fn write(&self, dir: &Path, filename: &str, subdir: Option<&str>, data: &[u8]) -> AppResult<SavedFile> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error(dir, e))?;
        let path = dir.join(filename);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| io_error(&path, e))?;

        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        let saved = SavedFile {
            name: filename.to_string(),
            subdir: subdir.map(str::to_string),
            uri: format!("file://{}", absolute.display()),
            size: data.len() as u64,
            saved_at: now_rfc3339(),
        };

        // Local history only, never synced
        let _guard = self.ctx.write()?;
        self.ctx.save_record(Collection::Downloads, &saved)?;
        Ok(saved)
    }

    fn dir(&self, subdir: Option<&str>) -> AppResult<PathBuf> {
        match subdir {
            Some(subdir) => {
                check_name(subdir)?;
                Ok(self.root.join(subdir))
            }
            None => Ok(self.root.clone()),
        }
    }
}

fn record_key(filename: &str, subdir: Option<&str>) -> String {
    match subdir {
        Some(subdir) => format!("{subdir}/{filename}"),
        None => filename.to_string(),
    }
}

/// A single path component: no separators, no traversal
fn check_name(name: &str) -> AppResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(AppError::Validation(format!("Nome de arquivo inválido: '{name}'")));
    }
    Ok(())
}

fn io_error(path: &Path, err: std::io::Error) -> AppError {
    AppError::File(format!("{}: {err}", path.display()))
}
