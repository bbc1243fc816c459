//! Files, FIFOs, devices, and the process's own stdin/stdout.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::{info, warn};
use uuid::Uuid;

use adsbus_core::{FileMode, Role};

use crate::bus::{Bus, BusReactor, Wakeup};
use crate::flow::{Owner, PeerId};
use crate::stream::Stream;
use crate::sys::{self, SavedFlags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Path { path: PathBuf, mode: FileMode },
    Stdin,
    Stdout,
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path { path, .. } => write!(f, "{}", path.display()),
            FileSource::Stdin => f.write_str("stdin"),
            FileSource::Stdout => f.write_str("stdout"),
        }
    }
}

pub struct FileTransport {
    pub id: Uuid,
    source: FileSource,
    role: Role,
    attempt: u32,
    /// Reopen after close. Off for stdio and for reads of regular files,
    /// where EOF means the input is used up.
    retry: bool,
    /// stdin/stdout flags as they were before the bus made them non-blocking.
    saved: Option<SavedFlags>,
}

impl FileTransport {
    pub(crate) fn is_stdout(&self) -> bool {
        self.source == FileSource::Stdout
    }
}

pub(crate) struct Opened {
    pub stream: Stream,
    /// Reopen after the stream closes.
    pub retry: bool,
    pub saved: Option<SavedFlags>,
}

pub(crate) fn open_source(source: &FileSource, role: Role) -> io::Result<Opened> {
    match source {
        FileSource::Stdin => dup_stdio(io::stdin().as_fd()),
        FileSource::Stdout => dup_stdio(io::stdout().as_fd()),
        FileSource::Path { path, mode } => {
            let mut options = OpenOptions::new();
            match mode {
                FileMode::Read => {
                    options.read(true);
                }
                FileMode::Write => {
                    options.write(true).create(true).truncate(true).read(role.receives());
                }
                FileMode::Append => {
                    options.append(true).create(true).read(role.receives());
                }
            }
            // O_NONBLOCK: opening a FIFO must not stall the loop waiting
            // for the other end.
            options
                .mode(0o600)
                .custom_flags(libc::O_NOFOLLOW | libc::O_NOCTTY | libc::O_NONBLOCK);
            let file = options.open(path)?;
            let regular = file.metadata()?.is_file();
            let retry = !(*mode == FileMode::Read && regular);
            Ok(Opened {
                stream: Stream::File(file),
                retry,
                saved: None,
            })
        }
    }
}

/// The dup shares its file description (and so its flags) with the original,
/// which may be a terminal the shell still uses.
fn dup_stdio(fd: std::os::fd::BorrowedFd<'_>) -> io::Result<Opened> {
    let file = File::from(fd.try_clone_to_owned()?);
    let mut saved = None;
    if !file.metadata()?.is_file() {
        saved = Some(SavedFlags::save(fd.as_raw_fd())?);
        sys::set_nonblocking(&file)?;
    }
    Ok(Opened {
        stream: Stream::File(file),
        retry: false,
        saved,
    })
}

impl Bus {
    pub(crate) fn add_file(&mut self, reactor: &mut BusReactor, source: FileSource, role: Role) {
        let id = self.next_id();
        self.counts.add(role);
        let retry = matches!(source, FileSource::Path { .. });
        self.files.insert(
            id,
            FileTransport {
                id: Uuid::new_v4(),
                source,
                role,
                attempt: 0,
                retry,
                saved: None,
            },
        );
        self.file_open(reactor, id);
    }

    fn file_open(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ft) = self.files.get_mut(&id) else {
            return;
        };
        let transport = ft.id;
        let role = ft.role;
        match open_source(&ft.source, role) {
            Ok(Opened { stream, retry, saved }) => {
                info!(%transport, "Opened {}", ft.source);
                ft.attempt = 0;
                ft.retry = retry;
                ft.saved = saved;
                if let Err(e) = self.attach_stream(reactor, stream, role, Some(Owner::File(id))) {
                    warn!(%transport, "File unusable: {e}");
                    self.file_closed(reactor, id);
                }
            }
            Err(e) => {
                warn!(%transport, "Failed to open {}: {e}", ft.source);
                self.file_closed(reactor, id);
            }
        }
    }

    /// The file's peers are gone, or it never opened.
    pub(crate) fn file_closed(&mut self, reactor: &mut BusReactor, id: PeerId) {
        let Some(ft) = self.files.get_mut(&id) else {
            return;
        };
        let transport = ft.id;
        if ft.retry {
            info!(%transport, "Closed {}; reopening", ft.source);
            let attempt = ft.attempt;
            ft.attempt = ft.attempt.saturating_add(1);
            self.schedule_retry(reactor, transport, attempt, Wakeup::File(id));
            return;
        }
        info!(%transport, "Closed {}", ft.source);
        let role = ft.role;
        self.files.remove(&id);
        self.counts.remove(role);
    }

    pub(crate) fn file_wakeup(&mut self, reactor: &mut BusReactor, id: PeerId) {
        if self.files.contains_key(&id) {
            self.file_open(reactor, id);
        }
    }
}
