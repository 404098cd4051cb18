//! Recording of published messages.
//!
//! When a recording directory is configured, every locally published message
//! is appended as one JSON line to numbered record files; files rotate after
//! the configured record cap. The current subscription filter is mirrored
//! into `topics.txt` alongside.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use weft_core::{Message, Topic};

#[derive(Debug)]
pub(crate) enum RecorderMsg {
    /// Append one published message.
    Record(Message),
    /// Rewrite the subscribed-topics file.
    Topics(Vec<Topic>),
}

pub(crate) fn spawn_recorder(directory: PathBuf, file_cap: u64) -> mpsc::Sender<RecorderMsg> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run(directory, file_cap.max(1), rx));
    tx
}

async fn run(directory: PathBuf, file_cap: u64, mut rx: mpsc::Receiver<RecorderMsg>) {
    if let Err(error) = fs::create_dir_all(&directory) {
        warn!(dir = %directory.display(), %error, "cannot create recording directory");
        return;
    }
    debug!(dir = %directory.display(), "recording published messages");

    let mut writer: Option<BufWriter<File>> = None;
    let mut file_index = 0u32;
    let mut records_in_file = 0u64;

    while let Some(msg) = rx.recv().await {
        match msg {
            RecorderMsg::Topics(topics) => {
                let lines: String =
                    topics.iter().map(|t| format!("{t}\n")).collect();
                if let Err(error) = fs::write(directory.join("topics.txt"), lines) {
                    warn!(%error, "cannot write topics file");
                }
            }
            RecorderMsg::Record(message) => {
                if writer.is_none() || records_in_file >= file_cap {
                    let path = directory.join(format!("records-{file_index:04}.jsonl"));
                    file_index += 1;
                    records_in_file = 0;
                    match File::create(&path) {
                        Ok(file) => writer = Some(BufWriter::new(file)),
                        Err(error) => {
                            warn!(path = %path.display(), %error, "cannot open record file");
                            return;
                        }
                    }
                }
                let out = writer.as_mut().expect("writer is open");
                match serde_json::to_string(&message) {
                    Ok(line) => {
                        if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
                            warn!("record write failed, stopping recorder");
                            return;
                        }
                        records_in_file += 1;
                    }
                    Err(error) => warn!(%error, "cannot serialize record"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn records_rotate_at_the_file_cap() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_recorder(dir.path().to_path_buf(), 2);

        for i in 0..5 {
            let message = Message::data(
                Topic::parse(format!("t/{i}")).unwrap(),
                Bytes::from_static(b"v"),
            );
            tx.send(RecorderMsg::Record(message)).await.unwrap();
        }
        tx.send(RecorderMsg::Topics(vec![Topic::parse("t").unwrap()])).await.unwrap();
        drop(tx);
        // Give the recorder task a moment to drain and flush.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "records-0000.jsonl".to_string(),
                "records-0001.jsonl".to_string(),
                "records-0002.jsonl".to_string(),
                "topics.txt".to_string(),
            ]
        );
        let first = fs::read_to_string(dir.path().join("records-0000.jsonl")).unwrap();
        assert_eq!(first.lines().count(), 2);
        let topics = fs::read_to_string(dir.path().join("topics.txt")).unwrap();
        assert_eq!(topics.trim(), "t");
    }
}
