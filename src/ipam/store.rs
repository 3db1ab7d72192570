//! Reservation ledger persisted as plain text, one reservation per line.
//!
//! Concurrent plugin invocations on the same node serialize on an exclusive
//! `flock` of the ledger file. The lock is held across the whole
//! load-mutate-save cycle of a [`ReservationStore::transaction`].

use itertools::Itertools;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Reservation, ReservationSet};
use crate::error::{Error, Result};

const LEDGER_MODE: u32 = 0o600;

fn open_ledger(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::store(parent, e))?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(LEDGER_MODE)
        .open(path)
        .map_err(|e| Error::store(path, e))
}

fn parse_ledger(path: &Path, content: &str) -> Result<ReservationSet> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<Reservation>().map_err(|reason| {
                Error::store(
                    path,
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bad ledger line {line:?}: {reason}"),
                    ),
                )
            })
        })
        .collect()
}

fn render_ledger(reservations: &ReservationSet) -> String {
    if reservations.is_empty() {
        return String::new();
    }
    format!("{}\n", reservations.iter().join("\n"))
}

/// Read the ledger at `path`, creating an empty one if it does not exist.
pub fn load_reservations(path: impl AsRef<Path>) -> Result<ReservationSet> {
    let path = path.as_ref();
    let mut file = open_ledger(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| Error::store(path, e))?;
    parse_ledger(path, &content)
}

/// Rewrite the ledger at `path` with `reservations`, in their current order.
pub fn save_reservations(path: impl AsRef<Path>, reservations: &ReservationSet) -> Result<()> {
    let path = path.as_ref();
    let mut file = open_ledger(path)?;
    rewrite(&mut file, path, reservations)
}

fn rewrite(file: &mut File, path: &Path, reservations: &ReservationSet) -> Result<()> {
    let content = render_ledger(reservations);
    file.set_len(0).map_err(|e| Error::store(path, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::store(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| Error::store(path, e))?;
    file.sync_all().map_err(|e| Error::store(path, e))
}

/// Lock-guarded access to the ledger of one network.
#[derive(Debug, Clone)]
pub struct ReservationStore {
    path: PathBuf,
}

impl ReservationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<Flock<File>> {
        let file = open_ledger(&self.path)?;
        debug!("Waiting for ledger lock on {}", self.path.display());
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::store(&self.path, io::Error::from(errno)))
    }

    /// Run `f` against the current reservations while holding the ledger lock.
    ///
    /// The ledger is rewritten only when `f` succeeds; an error leaves it untouched.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ReservationSet) -> Result<T>,
    {
        let mut ledger = self.lock()?;

        let mut content = String::new();
        ledger
            .read_to_string(&mut content)
            .map_err(|e| Error::store(&self.path, e))?;
        let mut reservations = parse_ledger(&self.path, &content)?;

        let out = f(&mut reservations)?;

        rewrite(&mut ledger, &self.path, &reservations)?;
        debug!(
            "Ledger {} now holds {} reservations",
            self.path.display(),
            reservations.len()
        );
        Ok(out)
    }

    /// Current reservations, read under the lock.
    pub fn snapshot(&self) -> Result<ReservationSet> {
        let mut ledger = self.lock()?;
        let mut content = String::new();
        ledger
            .read_to_string(&mut content)
            .map_err(|e| Error::store(&self.path, e))?;
        parse_ledger(&self.path, &content)
    }
}
