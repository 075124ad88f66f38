//! Append-only journal backing the durable queue
//!
//! Every publish is written (and synced per policy) before the publisher is
//! answered; acks and dead-letter decisions are appended as they happen.
//! Replaying the journal yields the messages still owed to consumers.
//!
//! A journal belongs to a single process; two queues must not open the same
//! file.
//!
//! Record format: [MAGIC][TAG][OP][CHANNEL][BODY_LEN][BODY][CRC32]

use super::Channel;
use crate::common::{crc32, Error, Result, SyncPolicy};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const JOURNAL_MAGIC: [u8; 4] = [0x4B, 0x56, 0x51, 0x31]; // "KVQ1"
const OP_PUBLISH: u8 = 1;
const OP_ACK: u8 = 2;
const OP_DEAD: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub tag: u64,
    pub channel: Channel,
    pub op: JournalOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Publish { body: Vec<u8> },
    Ack,
    DeadLetter,
}

/// A message rebuilt from the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledMessage {
    pub tag: u64,
    pub channel: Channel,
    pub body: Vec<u8>,
}

/// Journal state after replay
#[derive(Debug, Default)]
pub struct Recovered {
    /// Published and never settled, in publish order
    pub pending: Vec<JournaledMessage>,
    pub dead_lettered: Vec<JournaledMessage>,
    pub next_tag: u64,
}

pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    sync_policy: SyncPolicy,
}

impl Journal {
    /// Open or create the journal, replaying what it holds.
    ///
    /// The file is rewritten with only live records, which also drops a torn
    /// tail left by a crash mid-append.
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<(Self, Recovered)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let recovered = Self::recover(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut journal = Self {
            path,
            writer: BufWriter::new(file),
            sync_policy,
        };
        journal.rewrite(&recovered.pending, &recovered.dead_lettered)?;

        tracing::info!(
            path = %journal.path.display(),
            pending = recovered.pending.len(),
            dead_lettered = recovered.dead_lettered.len(),
            "Queue journal recovered"
        );

        Ok((journal, recovered))
    }

    fn recover(path: &Path) -> Result<Recovered> {
        let mut live: BTreeMap<u64, JournaledMessage> = BTreeMap::new();
        let mut dead: BTreeMap<u64, JournaledMessage> = BTreeMap::new();
        let mut max_tag = None;

        Self::replay(path, |entry| {
            max_tag = Some(max_tag.unwrap_or(0).max(entry.tag));
            match entry.op {
                JournalOp::Publish { body } => {
                    live.insert(
                        entry.tag,
                        JournaledMessage {
                            tag: entry.tag,
                            channel: entry.channel,
                            body,
                        },
                    );
                }
                JournalOp::Ack => {
                    live.remove(&entry.tag);
                }
                JournalOp::DeadLetter => {
                    if let Some(message) = live.remove(&entry.tag) {
                        dead.insert(entry.tag, message);
                    }
                }
            }
            Ok(())
        })?;

        Ok(Recovered {
            pending: live.into_values().collect(),
            dead_lettered: dead.into_values().collect(),
            next_tag: max_tag.map(|t| t + 1).unwrap_or(0),
        })
    }

    pub fn append_publish(&mut self, tag: u64, channel: Channel, body: &[u8]) -> Result<()> {
        self.write_entry(tag, OP_PUBLISH, channel, body)?;
        self.maybe_sync()
    }

    pub fn append_ack(&mut self, tag: u64, channel: Channel) -> Result<()> {
        self.write_entry(tag, OP_ACK, channel, &[])?;
        self.maybe_sync()
    }

    pub fn append_dead_letter(&mut self, tag: u64, channel: Channel) -> Result<()> {
        self.write_entry(tag, OP_DEAD, channel, &[])?;
        self.maybe_sync()
    }

    /// Replace the journal with the given live messages (compaction)
    pub fn rewrite(
        &mut self,
        pending: &[JournaledMessage],
        dead_lettered: &[JournaledMessage],
    ) -> Result<()> {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            let mut all: Vec<&JournaledMessage> =
                pending.iter().chain(dead_lettered.iter()).collect();
            all.sort_by_key(|m| m.tag);
            for message in all {
                encode_entry(
                    &mut tmp,
                    message.tag,
                    OP_PUBLISH,
                    message.channel,
                    &message.body,
                )?;
            }
            for message in dead_lettered {
                encode_entry(&mut tmp, message.tag, OP_DEAD, message.channel, &[])?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    fn write_entry(&mut self, tag: u64, op: u8, channel: Channel, body: &[u8]) -> Result<()> {
        encode_entry(&mut self.writer, tag, op, channel, body)
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            SyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            SyncPolicy::Interval => {
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    /// Replay journal entries in file order
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(JournalEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);

        loop {
            match Self::read_entry_internal(&mut reader) {
                Ok(Some(entry)) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Journal replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn read_entry_internal<R: Read>(reader: &mut R) -> Result<Option<JournalEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != JOURNAL_MAGIC {
            return Err(Error::Journal("Invalid journal magic".into()));
        }

        let mut tag_bytes = [0u8; 8];
        reader.read_exact(&mut tag_bytes)?;

        let mut op = [0u8; 1];
        reader.read_exact(&mut op)?;

        let mut channel = [0u8; 1];
        reader.read_exact(&mut channel)?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let body_len = u32::from_le_bytes(len_bytes) as usize;

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed = crc32(&checksum_payload(
            &tag_bytes,
            op[0],
            channel[0],
            &len_bytes,
            &body,
        ));
        if computed != stored_checksum {
            return Err(Error::Journal("Checksum mismatch".into()));
        }

        let channel = Channel::from_code(channel[0])
            .ok_or_else(|| Error::Journal(format!("Unknown channel code: {}", channel[0])))?;

        let op = match op[0] {
            OP_PUBLISH => JournalOp::Publish { body },
            OP_ACK => JournalOp::Ack,
            OP_DEAD => JournalOp::DeadLetter,
            other => return Err(Error::Journal(format!("Unknown op code: {}", other))),
        };

        Ok(Some(JournalEntry {
            tag: u64::from_le_bytes(tag_bytes),
            channel,
            op,
        }))
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn checksum_payload(tag: &[u8; 8], op: u8, channel: u8, len: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + 1 + 1 + 4 + body.len());
    data.extend_from_slice(tag);
    data.push(op);
    data.push(channel);
    data.extend_from_slice(len);
    data.extend_from_slice(body);
    data
}

fn encode_entry<W: Write>(
    writer: &mut W,
    tag: u64,
    op: u8,
    channel: Channel,
    body: &[u8],
) -> Result<()> {
    let tag_bytes = tag.to_le_bytes();
    let len_bytes = (body.len() as u32).to_le_bytes();
    let checksum = crc32(&checksum_payload(
        &tag_bytes,
        op,
        channel.code(),
        &len_bytes,
        body,
    ));

    writer.write_all(&JOURNAL_MAGIC)?;
    writer.write_all(&tag_bytes)?;
    writer.write_all(&[op, channel.code()])?;
    writer.write_all(&len_bytes)?;
    writer.write_all(body)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}
