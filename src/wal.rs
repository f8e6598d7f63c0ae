//! Event log for the booking core. Every accepted mutation lands here
//! before it is applied in memory; boot replays the whole file to
//! rebuild the engine, and compaction rewrites it down to the snapshot
//! events that state needs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::model::Event;

/// Framing bytes around each bincode payload: u32 length before,
/// u32 crc32 after. Little-endian.
const FRAME_OVERHEAD: usize = 8;

/// Serialize one event into its on-disk frame.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Append-only write-ahead log of booking events.
///
/// A crash can only damage the tail: the length prefix and checksum let
/// replay drop everything from the first short or corrupt frame on.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append one event and fsync. Test convenience; the writer task
    /// batches with `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.writer.write_all(&frame(event)?)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Phase one of compaction: write the snapshot events to a sibling
    /// temp file and fsync it. This is the slow half; associated
    /// function so the snapshot can be framed without the live writer.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for event in events {
            writer.write_all(&frame(event)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the temp file over the live log and reopen the
    /// writer on it. The rename is atomic, so a crash between the two
    /// phases leaves the old log intact.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from the log. A missing file is an empty
    /// log; a damaged tail is dropped with a warning and everything
    /// before it is kept.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        let mut pos = 0;
        while data.len() - pos >= FRAME_OVERHEAD {
            let mut le = [0u8; 4];
            le.copy_from_slice(&data[pos..pos + 4]);
            let len = u32::from_le_bytes(le) as usize;

            let end = pos + 4 + len;
            if end + 4 > data.len() {
                break; // short frame: crash mid-append
            }
            let payload = &data[pos + 4..end];
            le.copy_from_slice(&data[end..end + 4]);
            if u32::from_le_bytes(le) != crc32fast::hash(payload) {
                break; // checksum failed, nothing after it is trustworthy
            }
            match bincode::deserialize::<Event>(payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            pos = end + 4;
        }

        if pos < data.len() {
            warn!(
                kept = events.len(),
                dropped_bytes = data.len() - pos,
                "discarded damaged log tail"
            );
        }
        debug!(events = events.len(), "log replayed");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PaymentKind, Window};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("voltra_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn station_event(id: Ulid) -> Event {
        Event::StationRegistered {
            id,
            name: Some("District 1".into()),
            total_slots: 8,
            available_slots: 8,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let station_id = Ulid::new();
        let events = vec![
            station_event(station_id),
            Event::CarRegistered {
                id: Ulid::new(),
                station_id,
                hourly_rate: 50_000,
                daily_rate: 500_000,
                battery_pct: 95,
            },
            Event::PaymentInitiated {
                id: Ulid::new(),
                booking_id: Ulid::new(),
                amount: 60_000,
                kind: PaymentKind::Deposit,
                gateway_ref: "gw-123".into(),
                checkout_url: None,
                expires_at: Some(900_000),
                created_at: 1000,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = station_event(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let event = Event::SlotsAdjusted {
            station_id: Ulid::new(),
            delta: -1,
        };

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&event).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let station_id = Ulid::new();

        // Create, then churn the counter up and down
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&station_event(station_id)).unwrap();
            for _ in 0..10 {
                wal.append(&Event::SlotsAdjusted { station_id, delta: -1 }).unwrap();
                wal.append(&Event::SlotsAdjusted { station_id, delta: 1 }).unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the station at its current counter
        let compacted_events = vec![station_event(station_id)];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted_events).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted_events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let station_id = Ulid::new();
        let compacted = vec![station_event(station_id)];

        let new_event = Event::BookingCreated {
            id: Ulid::new(),
            user_id: Ulid::new(),
            car_id: Ulid::new(),
            pickup_station_id: station_id,
            return_station_id: Some(station_id),
            window: Window::new(1000, 2000),
            hourly_rate: 50_000,
            daily_rate: 500_000,
            total_amount: 50_000,
            deposit_amount: 15_000,
            created_at: 500,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&new_event).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|_| station_event(Ulid::new())).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }
}
