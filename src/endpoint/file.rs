// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # File Inbound Channel Adapter
//!
//! Polls a directory and emits one message per regular file, each file at most
//! once per adapter instance. Files are visited in name order. A file that
//! disappears is forgotten, so one later created under the same name is sent
//! again. Unreadable files are reported and skipped without holding back the
//! others.

use super::component_type;
use crate::{
    channel::ChannelRegistry,
    errors::IntegrationError,
    events::IntegrationEvent,
    flow::Lifecycle,
    history,
    message::{headers, MessageBuilder, Payload},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInboundConfig {
    pub id: String,
    pub directory: PathBuf,
    pub channel: String,
    pub poll_interval_ms: u64,
    /// Only files whose name ends with it are picked up.
    pub suffix: Option<String>,
}

impl Default for FileInboundConfig {
    fn default() -> Self {
        FileInboundConfig {
            id: String::default(),
            directory: PathBuf::default(),
            channel: String::default(),
            poll_interval_ms: 1_000,
            suffix: None,
        }
    }
}

impl FileInboundConfig {
    pub fn new(id: &str, directory: impl Into<PathBuf>, channel: &str) -> FileInboundConfig {
        FileInboundConfig {
            id: id.to_owned(),
            directory: directory.into(),
            channel: channel.to_owned(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn io_error(path: &Path, err: std::io::Error) -> IntegrationError {
    IntegrationError::InternalError(format!("failure to read `{}`: {err}", path.display()))
}

struct FilePoller {
    config: FileInboundConfig,
    registry: ChannelRegistry,
    seen: Mutex<HashSet<PathBuf>>,
}

impl FilePoller {
    fn accepts(&self, name: &str) -> bool {
        self.config
            .suffix
            .as_deref()
            .map_or(true, |suffix| name.ends_with(suffix))
    }

    /// Lists the files not sent yet and forgets the sent ones that are gone.
    async fn candidates(&self) -> Result<Vec<PathBuf>, IntegrationError> {
        let dir = &self.config.directory;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|err| io_error(dir, err))?;

        let mut listed = HashSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| io_error(dir, err))? {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or_default();
            if is_file && self.accepts(&entry.file_name().to_string_lossy()) {
                listed.insert(entry.path());
            }
        }

        let mut seen = self.seen.lock().await;
        seen.retain(|path| listed.contains(path));
        let mut found: Vec<PathBuf> = listed
            .into_iter()
            .filter(|path| !seen.contains(path))
            .collect();
        found.sort();
        Ok(found)
    }

    async fn poll_once(&self) -> Result<usize, IntegrationError> {
        let paths = self.candidates().await?;
        self.send_files(paths).await
    }

    /// Sends `paths` in order. Read failures skip the file; a failed send
    /// stops the batch. Neither marks the file as seen.
    async fn send_files(&self, paths: Vec<PathBuf>) -> Result<usize, IntegrationError> {
        let mut sent = 0;
        for path in paths {
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(err) => {
                    let err = io_error(&path, err);
                    warn!(
                        error = err.to_string(),
                        adapter = self.config.id,
                        "skipping unreadable file"
                    );
                    self.registry.events().emit(IntegrationEvent::FileReadFailed {
                        adapter: self.config.id.clone(),
                        path: path.display().to_string(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let message = MessageBuilder::with_payload(Payload::Bytes(content))
                .header(headers::FILE_NAME, name.as_str())
                .header(headers::FILE_PATH, path.display().to_string())
                .build();
            let message = history::record(
                &message,
                &self.config.id,
                component_type::FILE_INBOUND_CHANNEL_ADAPTER,
            );

            self.registry.send(&self.config.channel, message).await?;
            debug!(adapter = self.config.id, file = name, "file sent");
            self.seen.lock().await.insert(path);
            sent += 1;
        }
        Ok(sent)
    }
}

/// Emits the files of a directory as messages.
pub struct FileInboundAdapter {
    poller: Arc<FilePoller>,
    running: AtomicBool,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FileInboundAdapter {
    pub fn new(
        config: FileInboundConfig,
        registry: ChannelRegistry,
    ) -> Result<FileInboundAdapter, IntegrationError> {
        if config.id.is_empty() || config.channel.is_empty() {
            return Err(IntegrationError::ConfigurationError(
                "file adapter id and channel are required".to_owned(),
            ));
        }
        if config.poll_interval_ms == 0 {
            return Err(IntegrationError::ConfigurationError(
                "poll_interval_ms must be positive".to_owned(),
            ));
        }

        Ok(FileInboundAdapter {
            poller: Arc::new(FilePoller {
                config,
                registry,
                seen: Mutex::new(HashSet::new()),
            }),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FileInboundConfig {
        &self.poller.config
    }

    /// Sends every new file once.
    ///
    /// # Returns
    /// How many files were sent. A file that could not be read or sent is
    /// picked up again by the next poll.
    pub async fn poll_once(&self) -> Result<usize, IntegrationError> {
        self.poller.poll_once().await
    }
}

#[async_trait]
impl Lifecycle for FileInboundAdapter {
    fn name(&self) -> &str {
        &self.poller.config.id
    }

    async fn start(&self) -> Result<(), IntegrationError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let directory = &self.poller.config.directory;
        if !tokio::fs::metadata(directory)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Err(IntegrationError::ConfigurationError(format!(
                "`{}` is not a directory",
                directory.display()
            )));
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            let poller = self.poller.clone();
            async move {
                let mut ticks = tokio::time::interval(poller.config.poll_interval());
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = ticks.tick() => {}
                    }

                    if let Err(err) = poller.poll_once().await {
                        error!(
                            error = err.to_string(),
                            adapter = poller.config.id,
                            "failure to poll directory"
                        );
                    }
                }
            }
        });

        *task = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        debug!(adapter = self.poller.config.id, "file polling started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        token.cancel();
        handle
            .await
            .map_err(|err| IntegrationError::InternalError(err.to_string()))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::ChannelKind, events::EventStream};
    use std::fs;

    fn adapter_on(dir: &Path, registry: &ChannelRegistry) -> FileInboundAdapter {
        FileInboundAdapter::new(FileInboundConfig::new("f", dir, "files"), registry.clone()).unwrap()
    }

    #[tokio::test]
    async fn should_send_each_file_once_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "second").unwrap();
        fs::write(dir.path().join("a.txt"), "first").unwrap();
        fs::write(dir.path().join("skip.tmp"), "ignored").unwrap();
        fs::create_dir(dir.path().join("nested.txt")).unwrap();

        let registry = ChannelRegistry::new(EventStream::new());
        let out = registry.declare("files", ChannelKind::queue(8)).await.unwrap();
        let mut config = FileInboundConfig::new("fileAdapter", dir.path(), "files");
        config.suffix = Some(".txt".into());
        let adapter = FileInboundAdapter::new(config, registry).unwrap();

        assert_eq!(adapter.poll_once().await.unwrap(), 2);
        assert_eq!(adapter.poll_once().await.unwrap(), 0);

        let first = out.try_receive().await.unwrap().unwrap();
        assert_eq!(first.payload(), &Payload::Bytes(b"first".to_vec()));
        assert_eq!(first.header_str(headers::FILE_NAME), Some("a.txt"));
        let entry = history::read(&first).locate("fileAdapter", 0).cloned().unwrap();
        assert_eq!(entry.component_type, component_type::FILE_INBOUND_CHANNEL_ADAPTER);
        let second = out.try_receive().await.unwrap().unwrap();
        assert_eq!(second.header_str(headers::FILE_NAME), Some("b.txt"));
    }

    #[tokio::test]
    async fn should_retry_files_whose_send_failed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "data").unwrap();

        let registry = ChannelRegistry::new(EventStream::new());
        let out = registry.declare("files", ChannelKind::fail_fast_queue(1)).await.unwrap();
        out.send(crate::message::Message::new("occupying")).await.unwrap();
        let adapter = adapter_on(dir.path(), &registry);

        assert!(adapter.poll_once().await.is_err());
        out.try_receive().await.unwrap();
        assert_eq!(adapter.poll_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn should_skip_unreadable_file_and_send_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "gone soon").unwrap();
        fs::write(dir.path().join("b.txt"), "still here").unwrap();

        let events = EventStream::new();
        let mut received = events.subscribe();
        let registry = ChannelRegistry::new(events);
        let out = registry.declare("files", ChannelKind::queue(8)).await.unwrap();
        let adapter = adapter_on(dir.path(), &registry);

        let listed = adapter.poller.candidates().await.unwrap();
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        assert_eq!(adapter.poller.send_files(listed).await.unwrap(), 1);

        let message = out.try_receive().await.unwrap().unwrap();
        assert_eq!(message.header_str(headers::FILE_NAME), Some("b.txt"));
        match received.recv().await.unwrap() {
            IntegrationEvent::FileReadFailed { adapter, path, .. } => {
                assert_eq!(adapter, "f");
                assert!(path.ends_with("a.txt"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        fs::write(dir.path().join("a.txt"), "back again").unwrap();
        assert_eq!(adapter.poll_once().await.unwrap(), 1);
        let message = out.try_receive().await.unwrap().unwrap();
        assert_eq!(message.header_str(headers::FILE_NAME), Some("a.txt"));
    }

    #[tokio::test]
    async fn should_forget_removed_files_and_send_recreated_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        fs::write(&path, "monday").unwrap();

        let registry = ChannelRegistry::new(EventStream::new());
        let out = registry.declare("files", ChannelKind::queue(8)).await.unwrap();
        let adapter = adapter_on(dir.path(), &registry);

        assert_eq!(adapter.poll_once().await.unwrap(), 1);
        fs::remove_file(&path).unwrap();
        assert_eq!(adapter.poll_once().await.unwrap(), 0);
        assert!(adapter.poller.seen.lock().await.is_empty());

        fs::write(&path, "tuesday").unwrap();
        assert_eq!(adapter.poll_once().await.unwrap(), 1);

        out.try_receive().await.unwrap().unwrap();
        let second = out.try_receive().await.unwrap().unwrap();
        assert_eq!(second.payload(), &Payload::Bytes(b"tuesday".to_vec()));
    }

    #[tokio::test]
    async fn should_reject_missing_directory_on_start() {
        let registry = ChannelRegistry::new(EventStream::new());
        let adapter = FileInboundAdapter::new(
            FileInboundConfig::new("f", "/definitely/not/here", "files"),
            registry,
        )
        .unwrap();

        assert!(matches!(
            adapter.start().await,
            Err(IntegrationError::ConfigurationError(_))
        ));
        assert!(!adapter.is_running());
    }

    #[tokio::test]
    async fn should_poll_in_background_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChannelRegistry::new(EventStream::new());
        let out = registry.declare("files", ChannelKind::queue(8)).await.unwrap();
        let mut config = FileInboundConfig::new("f", dir.path(), "files");
        config.poll_interval_ms = 20;
        config.suffix = Some(".txt".into());
        let adapter = FileInboundAdapter::new(config, registry).unwrap();

        adapter.start().await.unwrap();
        fs::write(dir.path().join("late.part"), "arrived").unwrap();
        fs::rename(dir.path().join("late.part"), dir.path().join("late.txt")).unwrap();
        let message = out.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(message.header_str(headers::FILE_NAME), Some("late.txt"));

        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
    }
}
