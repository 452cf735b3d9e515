use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

/// Encode a single event as one `[len][bincode][crc32]` frame.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` marks the end of the usable log: clean EOF,
/// a torn tail from a crash, a CRC mismatch or an undecodable payload.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_exact_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of one tenant.
///
/// Every committed state change is one frame; replaying all frames in order
/// rebuilds the tenant's calendars, appointments and waitlist.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

/// Committed end of the log, taken before a batch so a failed batch can be cut off.
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    len: u64,
    appends: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Buffer an event; nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn mark(&mut self) -> io::Result<Mark> {
        self.writer.flush()?;
        Ok(Mark {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Drop everything written or buffered since `mark`. Buffered bytes are
    /// discarded rather than flushed, and the file is truncated back.
    pub fn rollback(&mut self, mark: Mark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let (stale, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        drop(stale);
        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `snapshot`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in snapshot {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replay the WAL from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

// ── Group commit ─────────────────────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Cloneable handle to the task that owns a [`Wal`].
///
/// Appends that arrive while a flush is running are coalesced into the next
/// batch, so concurrent commits share one fsync.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Resolves once the event is durable.
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Append { event, response }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Compact { snapshot, response }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self.send(WalCommand::AppendsSinceCompact { response }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: WalCommand) -> io::Result<()> {
        self.tx.send(cmd).await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<(Event, oneshot::Sender<io::Result<()>>)> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut pending = Some(cmd);
        // Drain whatever is already queued into one batch; a non-append
        // command ends the batch and runs after it is flushed.
        while let Some(cmd) = pending.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    pending = rx.try_recv().ok();
                }
                other => {
                    flush_batch(&mut wal, &mut batch);
                    run_control(&mut wal, other);
                }
            }
        }
        flush_batch(&mut wal, &mut batch);
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = wal.mark().and_then(|mark| {
        let written = batch
            .iter()
            .try_for_each(|(event, _)| wal.append_buffered(event))
            .and_then(|()| wal.flush_sync());
        if written.is_err() {
            // Every caller in the batch sees an error, so none of it may survive a restart.
            if let Err(e) = wal.rollback(mark) {
                tracing::error!("WAL rollback after failed batch: {e}");
            }
        }
        written
    });
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, response) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(r);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.compact(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by writer_loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceInfo, WaitlistStatus};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("agenda_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_created() -> Event {
        Event::ResourceCreated {
            resource: ResourceInfo {
                id: Ulid::new(),
                name: Some("Dr. Vega".into()),
                bookable: true,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            resource_created(),
            Event::WaitlistClosed {
                id: Ulid::new(),
                status: WaitlistStatus::Expired,
                booked_appointment_id: None,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = resource_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap(); // length says 9, only 2 bytes follow
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&resource_created()).unwrap();
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let keep = resource_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..20 {
                wal.append(&resource_created()).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

            let later = resource_created();
            wal.append(&later).unwrap();
            assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        }
    }

    #[test]
    fn rollback_cuts_off_failed_batch() {
        let path = tmp_path("rollback.wal");
        let (first, lost, last) = (resource_created(), resource_created(), resource_created());
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();

        let mark = wal.mark().unwrap();
        wal.append_buffered(&lost).unwrap();
        // Part of the batch already reached the file when the batch failed.
        wal.writer.flush().unwrap();
        wal.append_buffered(&resource_created()).unwrap();
        wal.rollback(mark).unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        wal.append(&last).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, last]);
    }

    #[tokio::test]
    async fn handle_commits_concurrent_appends() {
        let path = tmp_path("handle_concurrent.wal");
        let handle = WalHandle::spawn(Wal::open(&path).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move { h.append(resource_created()).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(handle.appends_since_compact().await, 32);
        assert_eq!(Wal::replay(&path).unwrap().len(), 32);

        handle.compact(vec![resource_created()]).await.unwrap();
        assert_eq!(handle.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }
}
