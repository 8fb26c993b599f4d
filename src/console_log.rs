use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

const RULE_WIDTH: usize = 80;


/// Append-only session log of the child's console, opened lazily on first write.
pub struct ConsoleLog {
    path: PathBuf,
    file: Option<File>,
}

impl ConsoleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_line(&mut self, text: &str) {
        let mut record = String::with_capacity(text.len() + 1);
        record.push_str(text);
        record.push('\n');
        self.write(record.as_bytes()).await;
    }



    /*
        @@@
        @write_marker();
        . Frames a lifecycle action (STARTING, STOPPING, ...) between two rules of '='.
        . Stamps it with the local wall-clock time.
    */
    pub async fn write_marker(&mut self, action: &str) {
        let rule = "=".repeat(RULE_WIDTH);
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let block = format!("{rule}\n{stamp} - {action}\n{rule}\n");
        self.write(block.as_bytes()).await;
    }

    async fn write(&mut self, bytes: &[u8]) {
        if self.file.is_none() {
            if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                let _ = tokio::fs::create_dir_all(dir).await;
            }
            match OpenOptions::new().create(true).append(true).open(&self.path).await {
                Ok(f) => {
                    debug!(path = %self.path.display(), "opened console log");
                    self.file = Some(f);
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "cannot open console log");
                    return;
                }
            }
        }

        if let Some(file) = self.file.as_mut() {
            let result = match file.write_all(bytes).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(path = %self.path.display(), error = %e, "error writing console log");
                self.file = None;
            }
        }
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_and_markers_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("service.log");

        let mut log = ConsoleLog::new(&path);
        log.write_marker("STARTING").await;
        log.write_line("listening on 8080").await;
        drop(log);

        let mut log = ConsoleLog::new(&path);
        log.write_marker("STOPPED").await;
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "=".repeat(80));
        assert!(lines[1].ends_with(" - STARTING"));
        assert_eq!(lines[3], "listening on 8080");
        assert!(lines[5].ends_with(" - STOPPED"));
    }

    #[tokio::test]
    async fn unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ConsoleLog::new(dir.path());
        log.write_line("dropped").await;
        assert_eq!(log.path(), dir.path());
    }
}
