// src/core/replication/sync.rs

//! Snapshot stream framing shared by both sides of a full resynchronization.
//!
//! Two framings exist on the wire: a length-prefixed form (`$<len>\r\n` then
//! the raw bytes), used when the snapshot size is known up front, and the
//! diskless form (`$EOF:<40 hex chars>\r\n` then the raw bytes, terminated
//! by the same 40-character delimiter), used when the snapshot is produced
//! while it streams.

use crate::core::QuartzError;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Length of the diskless end-of-stream delimiter.
pub const RDB_EOF_MARK_SIZE: usize = 40;

/// During a disk-backed snapshot reception, fsync once per this many bytes
/// so a slow disk never has to absorb the whole transfer at the end.
pub const REPL_MAX_WRITTEN_BEFORE_FSYNC: u64 = 8 * 1024 * 1024;

/// How a snapshot stream announces its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFraming {
    /// `$<len>`: exactly this many payload bytes follow.
    Length(u64),
    /// `$EOF:<delim>`: payload runs until the 40-byte delimiter reappears.
    Eof([u8; RDB_EOF_MARK_SIZE]),
}

/// `InitialSyncer` is used by a primary to write a snapshot to a replica
/// during a full resynchronization. It is generic over the stream type `S`.
pub struct InitialSyncer<'a, S: AsyncWrite + Unpin> {
    stream: &'a mut S,
}

impl<'a, S: AsyncWrite + Unpin> InitialSyncer<'a, S> {
    pub fn new(stream: &'a mut S) -> Self {
        Self { stream }
    }

    /// Sends a snapshot with the length-prefixed framing.
    pub async fn send_length_prefixed(&mut self, payload: &Bytes) -> Result<(), QuartzError> {
        let header = format!("${}\r\n", payload.len());
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a snapshot with the diskless delimiter framing. Returns the
    /// delimiter that was used.
    pub async fn send_eof_delimited(&mut self, payload: &Bytes) -> Result<String, QuartzError> {
        let delim = crate::core::random_hex_id();
        let header = format!("$EOF:{delim}\r\n");
        self.stream.write_all(header.as_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.write_all(delim.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(delim)
    }
}

/// Reads the `$...` preamble line announcing a snapshot stream.
pub async fn read_snapshot_preamble<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<SnapshotFraming, QuartzError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(QuartzError::Replication(
                "connection closed before the snapshot preamble".into(),
            ));
        }
        // Keepalive newlines may precede the preamble.
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            continue;
        }
        break;
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let Some(body) = trimmed.strip_prefix('$') else {
        return Err(QuartzError::Replication(format!(
            "expected snapshot length prefix, got: {trimmed}"
        )));
    };
    if let Some(delim) = body.strip_prefix("EOF:") {
        if delim.len() < RDB_EOF_MARK_SIZE {
            return Err(QuartzError::Replication("short snapshot EOF delimiter".into()));
        }
        let mut mark = [0u8; RDB_EOF_MARK_SIZE];
        mark.copy_from_slice(&delim.as_bytes()[..RDB_EOF_MARK_SIZE]);
        Ok(SnapshotFraming::Eof(mark))
    } else {
        let len: u64 = body
            .parse()
            .map_err(|_| QuartzError::Replication(format!("invalid snapshot length: {body}")))?;
        Ok(SnapshotFraming::Length(len))
    }
}

/// Receives a whole snapshot into memory (diskless load path).
pub async fn receive_snapshot_bytes<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    framing: &SnapshotFraming,
) -> Result<Bytes, QuartzError> {
    match framing {
        SnapshotFraming::Length(len) => {
            let mut payload = BytesMut::zeroed(*len as usize);
            reader.read_exact(&mut payload).await?;
            Ok(payload.freeze())
        }
        SnapshotFraming::Eof(mark) => {
            let mut payload = Vec::with_capacity(64 * 1024);
            let mut chunk = [0u8; 16 * 1024];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Err(QuartzError::Replication(
                        "connection closed mid-snapshot".into(),
                    ));
                }
                payload.extend_from_slice(&chunk[..n]);
                if payload.len() >= RDB_EOF_MARK_SIZE
                    && payload[payload.len() - RDB_EOF_MARK_SIZE..] == mark[..]
                {
                    payload.truncate(payload.len() - RDB_EOF_MARK_SIZE);
                    return Ok(Bytes::from(payload));
                }
            }
        }
    }
}

/// Receives a snapshot into a temp file, fsyncing periodically, then
/// atomically renames it to `final_path` and fsyncs the directory. Returns
/// the number of payload bytes written.
pub async fn receive_snapshot_to_file<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    framing: &SnapshotFraming,
    final_path: &Path,
) -> Result<u64, QuartzError> {
    let tmp_path = final_path.with_extension(format!("tmp-{}", std::process::id()));
    let mut file = File::create(&tmp_path).await?;
    let mut written: u64 = 0;
    let mut last_fsync: u64 = 0;
    let mut tail: Vec<u8> = Vec::new();

    let mut chunk = [0u8; 16 * 1024];
    let result: Result<u64, QuartzError> = async {
        loop {
            match framing {
                SnapshotFraming::Length(len) => {
                    if written >= *len {
                        break;
                    }
                    let want = ((*len - written) as usize).min(chunk.len());
                    let n = reader.read(&mut chunk[..want]).await?;
                    if n == 0 {
                        return Err(QuartzError::Replication(
                            "connection closed mid-snapshot".into(),
                        ));
                    }
                    file.write_all(&chunk[..n]).await?;
                    written += n as u64;
                }
                SnapshotFraming::Eof(mark) => {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(QuartzError::Replication(
                            "connection closed mid-snapshot".into(),
                        ));
                    }
                    // Hold back the last delimiter-length bytes; they may be
                    // the end marker rather than payload.
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() >= RDB_EOF_MARK_SIZE
                        && tail[tail.len() - RDB_EOF_MARK_SIZE..] == mark[..]
                    {
                        let payload_len = tail.len() - RDB_EOF_MARK_SIZE;
                        file.write_all(&tail[..payload_len]).await?;
                        written += payload_len as u64;
                        break;
                    }
                    if tail.len() > RDB_EOF_MARK_SIZE {
                        let flush_len = tail.len() - RDB_EOF_MARK_SIZE;
                        file.write_all(&tail[..flush_len]).await?;
                        written += flush_len as u64;
                        tail.drain(..flush_len);
                    }
                }
            }
            if written - last_fsync >= REPL_MAX_WRITTEN_BEFORE_FSYNC {
                file.sync_data().await?;
                last_fsync = written;
            }
        }
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, final_path).await?;
            if let Some(dir) = final_path.parent() {
                let dir = if dir.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    dir
                };
                if let Ok(dir_file) = std::fs::File::open(dir) {
                    dir_file.sync_all().ok();
                }
            }
            Ok(written)
        }
        Err(e) => {
            drop(file);
            tokio::fs::remove_file(&tmp_path).await.ok();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn length_prefixed_roundtrip() {
        let payload = Bytes::from_static(b"snapshot-payload");
        let mut wire = Vec::new();
        InitialSyncer::new(&mut wire)
            .send_length_prefixed(&payload)
            .await
            .unwrap();

        let mut reader = BufReader::new(&wire[..]);
        let framing = read_snapshot_preamble(&mut reader).await.unwrap();
        assert_eq!(framing, SnapshotFraming::Length(payload.len() as u64));
        let received = receive_snapshot_bytes(&mut reader, &framing).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn eof_delimited_roundtrip() {
        let payload = Bytes::from(vec![7u8; 100_000]);
        let mut wire = Vec::new();
        InitialSyncer::new(&mut wire)
            .send_eof_delimited(&payload)
            .await
            .unwrap();

        let mut reader = BufReader::new(&wire[..]);
        let framing = read_snapshot_preamble(&mut reader).await.unwrap();
        assert!(matches!(framing, SnapshotFraming::Eof(_)));
        let received = receive_snapshot_bytes(&mut reader, &framing).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn preamble_skips_keepalive_newlines() {
        let wire = b"\n\n$5\r\nhello".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let framing = read_snapshot_preamble(&mut reader).await.unwrap();
        assert_eq!(framing, SnapshotFraming::Length(5));
    }
}
