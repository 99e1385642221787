//! Exposure model, the persisted exposure queue and the set-number counter.

use crate::error::{ObsError, ObsResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

/// Shutter behaviour of an exposure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    #[default]
    Normal,
    Dark,
}

impl std::str::FromStr for FrameType {
    type Err = ObsError;

    fn from_str(s: &str) -> ObsResult<Self> {
        match s {
            "normal" => Ok(FrameType::Normal),
            "dark" => Ok(FrameType::Dark),
            other => Err(ObsError::InvalidArgument(format!(
                "Invalid frame type \"{}\", must be normal or dark",
                other
            ))),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FrameType::Normal => "normal",
            FrameType::Dark => "dark",
        })
    }
}

/// Strip field separators and control characters from free text stored in a queue line.
pub fn clean_field(text: &str) -> String {
    text.chars().filter(|c| *c != ';' && !c.is_control()).collect()
}

/// One exposure request, possibly on several unit telescopes at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub uts: Vec<u32>,
    /// Seconds.
    pub exptime: f64,
    /// `None` for no filter change (darks, or UTs without wheels).
    pub filt: Option<String>,
    pub binning: u32,
    pub frametype: FrameType,
    pub target: String,
    pub imgtype: String,
    pub glance: bool,
    pub set_num: Option<u64>,
    pub set_pos: u32,
    pub set_tot: u32,
    pub db_id: Option<i64>,
}

impl Exposure {
    pub fn new(uts: Vec<u32>, exptime: f64, filt: Option<String>) -> Self {
        Self {
            uts,
            exptime,
            filt,
            binning: 1,
            frametype: FrameType::Normal,
            target: "NA".to_string(),
            imgtype: "SCIENCE".to_string(),
            glance: false,
            set_num: None,
            set_pos: 1,
            set_tot: 1,
            db_id: None,
        }
    }

    pub fn is_dark(&self) -> bool {
        self.frametype == FrameType::Dark
    }

    pub fn in_set(&self) -> bool {
        self.set_num.is_some()
    }

    /// Parse one persisted queue line.
    ///
    /// ```text
    /// uts;exptime;filt|X;binning;frametype;target;imgtype;glance;set_num|-1;set_pos;set_tot;db_id|-1
    /// 1,2,4;20;R;2;normal;NA;SCIENCE;0;1000;1;3;126598
    /// ```
    pub fn from_line(line: &str) -> ObsResult<Self> {
        let fields: Vec<&str> = line.trim_end().split(';').collect();
        if fields.len() != 12 {
            return Err(ObsError::Parse(format!(
                "expected 12 fields, found {} in \"{}\"",
                fields.len(),
                line.trim_end()
            )));
        }
        let bad = |what: &str| ObsError::Parse(format!("invalid {} in \"{}\"", what, line.trim_end()));

        let uts = fields[0]
            .split(',')
            .map(|ut| ut.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| bad("uts"))?;
        let exptime = fields[1].parse::<f64>().map_err(|_| bad("exptime"))?;
        let filt = match fields[2] {
            "X" => None,
            f => Some(f.to_string()),
        };
        let binning = fields[3].parse::<u32>().map_err(|_| bad("binning"))?;
        let frametype = fields[4].parse::<FrameType>().map_err(|_| bad("frametype"))?;
        let glance = fields[7].parse::<u8>().map_err(|_| bad("glance"))? != 0;
        let set_num = fields[8].parse::<i64>().map_err(|_| bad("set_num"))?;
        let set_pos = fields[9].parse::<u32>().map_err(|_| bad("set_pos"))?;
        let set_tot = fields[10].parse::<u32>().map_err(|_| bad("set_tot"))?;
        let db_id = fields[11].parse::<i64>().map_err(|_| bad("db_id"))?;

        Ok(Self {
            uts,
            exptime,
            filt,
            binning,
            frametype,
            target: fields[5].to_string(),
            imgtype: fields[6].to_uppercase(),
            glance,
            set_num: u64::try_from(set_num).ok(),
            set_pos,
            set_tot,
            db_id: (db_id != -1).then_some(db_id),
        })
    }

    /// The persisted line form, without the trailing newline.
    pub fn as_line(&self) -> String {
        let uts: Vec<String> = self.uts.iter().map(u32::to_string).collect();
        format!(
            "{};{};{};{};{};{};{};{};{};{};{};{}",
            uts.join(","),
            self.exptime,
            self.filt.as_deref().unwrap_or("X"),
            self.binning,
            self.frametype,
            self.target,
            self.imgtype,
            u8::from(self.glance),
            self.set_num.map_or(-1, |n| n as i64),
            self.set_pos,
            self.set_tot,
            self.db_id.unwrap_or(-1),
        )
    }

    /// Multi-line readable summary.
    pub fn info(&self) -> String {
        let mut s = String::from("EXPOSURE\n");
        s += &format!("  Unit telescope(s): {:?}\n", self.uts);
        s += &format!("  Exposure time: {:.1}s\n", self.exptime);
        s += &format!("  Filter: {}\n", self.filt.as_deref().unwrap_or("None"));
        s += &format!("  Binning: {}x{}\n", self.binning, self.binning);
        s += &format!("  Frame type: {}\n", self.frametype);
        s += &format!("  Target: {}\n", self.target);
        s += &format!("  Image type: {}\n", self.imgtype);
        s += &format!("  Glance: {}\n", self.glance);
        if let Some(set_num) = self.set_num {
            s += &format!("  Set number: {}\n", set_num);
            s += &format!("  Position in set: {}/{}\n", self.set_pos, self.set_tot);
        }
        if let Some(db_id) = self.db_id {
            s += &format!("  Set database ID: {}\n", db_id);
        }
        s
    }
}

/// FIFO of pending exposures mirrored to a file.
///
/// Every mutation rewrites the whole file (temp file + rename) before returning, while
/// still holding the lock, so the file always matches memory.
pub struct ExposureQueue {
    path: PathBuf,
    items: Mutex<VecDeque<Exposure>>,
}

impl ExposureQueue {
    /// Load the queue from `path`, creating the file if it does not exist.
    ///
    /// Lines that do not parse are logged and dropped; the next mutation rewrites the file
    /// without them.
    pub fn load(path: impl Into<PathBuf>) -> ObsResult<Self> {
        let path = path.into();
        let mut items = VecDeque::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            for (n, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match Exposure::from_line(line) {
                    Ok(exposure) => items.push_back(exposure),
                    Err(err) => error!(
                        file = %path.display(),
                        line = n + 1,
                        "Dropping unreadable queue entry: {}",
                        err
                    ),
                }
            }
        }
        let queue = Self {
            path,
            items: Mutex::new(items),
        };
        if !queue.path.exists() {
            queue.write(&queue.items.lock())?;
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append exposures, returning the new length.
    pub fn extend(&self, exposures: Vec<Exposure>) -> ObsResult<usize> {
        let mut items = self.items.lock();
        let before = items.len();
        items.extend(exposures);
        if let Err(err) = self.write(&items) {
            items.truncate(before);
            return Err(err);
        }
        Ok(items.len())
    }

    pub fn pop_front(&self) -> ObsResult<Option<Exposure>> {
        let mut items = self.items.lock();
        let Some(exposure) = items.pop_front() else {
            return Ok(None);
        };
        if let Err(err) = self.write(&items) {
            items.push_front(exposure);
            return Err(err);
        }
        Ok(Some(exposure))
    }

    pub fn clear(&self) -> ObsResult<()> {
        let mut items = self.items.lock();
        self.write(&VecDeque::new())?;
        items.clear();
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<Exposure> {
        self.items.lock().iter().cloned().collect()
    }

    /// Readable listing of every queued exposure.
    pub fn get(&self) -> String {
        let items = self.items.lock();
        let mut s = format!("{} items in queue:\n", items.len());
        for (n, exposure) in items.iter().enumerate() {
            s += &format!("{:03}: {}", n + 1, exposure.info());
        }
        s.trim_end().to_string()
    }

    /// Listing in the persisted line form.
    pub fn get_simple(&self) -> String {
        let items = self.items.lock();
        let mut s = format!("{} items in queue:\n", items.len());
        for (n, exposure) in items.iter().enumerate() {
            s += &format!("{:03}: {}\n", n + 1, exposure.as_line());
        }
        s.trim_end().to_string()
    }

    fn write(&self, items: &VecDeque<Exposure>) -> ObsResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            writeln!(file, "#")?;
            for exposure in items {
                writeln!(file, "{}", exposure.as_line())?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Monotonic set-number counter persisted as a single integer.
///
/// Increments are serialised by an internal lock, so concurrent callers never share a number.
pub struct SetCounter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SetCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The last number handed out, `0` if none.
    pub fn latest(&self) -> ObsResult<u64> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| ObsError::Parse(format!("invalid set number in {}", self.path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Read, increment and write back.
    pub fn next(&self) -> ObsResult<u64> {
        self.next_with(Ok)
    }

    /// Take the next number and run `f` with it before the lock is released.
    ///
    /// The number stays used even if `f` fails.
    pub fn next_with<T>(&self, f: impl FnOnce(u64) -> ObsResult<T>) -> ObsResult<T> {
        let _guard = self.lock.lock();
        let next = self.increment()?;
        f(next)
    }

    fn increment(&self) -> ObsResult<u64> {
        let next = self.latest()? + 1;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", next))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(next)
    }
}
