use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dcpingest::message::DcpMsg;
use tracing::info;

/// Appends archived messages as JSON lines to one file per receive day.
pub struct DailyArchive {
    dir: PathBuf,
    current: Option<(NaiveDate, BufWriter<File>)>,
    written: u64,
}

impl DailyArchive {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating archive dir {dir:?}"))?;
        Ok(DailyArchive {
            dir: dir.to_path_buf(),
            current: None,
            written: 0,
        })
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("dcp-{}.jsonl", day.format("%Y%m%d")))
    }

    fn open(&mut self, day: NaiveDate) -> Result<()> {
        self.flush()?;
        let path = self.path_for(day);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening archive file {path:?}"))?;
        info!(?path, "archive file opened");
        self.current = Some((day, BufWriter::new(file)));
        Ok(())
    }

    pub fn write(&mut self, msg: &DcpMsg) -> Result<()> {
        let day = msg.recv_time().date_naive();
        if !matches!(&self.current, Some((current, _)) if *current == day) {
            self.open(day)?;
        }
        if let Some((_, writer)) = self.current.as_mut() {
            serde_json::to_writer(&mut *writer, msg).context("serializing message")?;
            writer.write_all(b"\n").context("writing message")?;
            writer.flush().context("flushing archive")?;
            self.written += 1;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.current.as_mut() {
            writer.flush().context("flushing archive")?;
        }
        Ok(())
    }

    /// Messages written since creation.
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use dcpingest::message::{MsgFlags, MsgType, SourceType};

    use super::*;

    fn msg(day: u32, payload: &[u8]) -> DcpMsg {
        DcpMsg::builder()
            .header("CE1234A0".to_string())
            .payload(payload.to_vec())
            .flags(MsgFlags::new(SourceType::NetDcp, MsgType::NetDcpPolled))
            .recv_time(Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap())
            .build()
    }

    fn read_day(archive: &DailyArchive, day: u32) -> Vec<DcpMsg> {
        let path = archive.path_for(NaiveDate::from_ymd_opt(2024, 6, day).unwrap());
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn writes_one_file_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = DailyArchive::new(&dir.path().join("archive")).unwrap();

        archive.write(&msg(10, b"one")).unwrap();
        archive.write(&msg(10, b"two")).unwrap();
        archive.write(&msg(11, b"three")).unwrap();

        let first = read_day(&archive, 10);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].payload(), b"two");
        assert_eq!(read_day(&archive, 11)[0].payload(), b"three");
        assert_eq!(archive.written(), 3);
    }

    #[test]
    fn appends_to_existing_day() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut archive = DailyArchive::new(dir.path()).unwrap();
            archive.write(&msg(10, b"one")).unwrap();
        }
        let mut archive = DailyArchive::new(dir.path()).unwrap();
        archive.write(&msg(10, b"two")).unwrap();

        assert_eq!(read_day(&archive, 10).len(), 2);
    }
}
