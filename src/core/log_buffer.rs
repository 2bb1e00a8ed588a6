// Log file creation/opening with metadata validation, mmap, and driver locking.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, HEADER_LENGTH};
use crate::core::layout::{self, LogMetadata, TermBuffer, LOG_META_DATA_LENGTH};
use crate::core::params::{PublicationParams, PAGE_SIZE, TERM_MAX_LENGTH, TERM_MIN_LENGTH};
use crate::core::position::{self, PARTITION_COUNT};

/// Largest dirty region zeroed in one cleaning pass.
pub const CLEAN_BLOCK_LENGTH_MAX: usize = 1024 * 1024;

#[derive(Debug)]
pub struct RawLog {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    base: *mut u8,
    term_length: usize,
    owns_lock: bool,
}

// The mapping is shared across threads and processes by design; every field
// mutated concurrently is accessed through the atomic protocol in `layout`.
unsafe impl Send for RawLog {}
unsafe impl Sync for RawLog {}

impl RawLog {
    /// Create, size, lock, and map a fresh log; write its static metadata and
    /// seed the active partition's raw tail from the starting point.
    pub fn create(
        path: impl AsRef<Path>,
        params: &PublicationParams,
        correlation_id: i64,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let term_length = params.term_length as usize;
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(create_error_kind(&err)).with_path(&path).with_source(err))?;

        let log_length = layout::compute_log_length(term_length);
        file.set_len(log_length as u64)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;

        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };
        let base = mmap.as_mut_ptr();

        let log = Self {
            path,
            file,
            mmap,
            base,
            term_length,
            owns_lock: true,
        };

        let meta = log.metadata();
        meta.set_correlation_id(correlation_id);
        meta.set_initial_term_id(params.initial_term_id);
        meta.set_default_frame_header_length(HEADER_LENGTH as i32);
        meta.set_mtu_length(params.mtu_length);
        meta.set_term_length(params.term_length);
        meta.set_page_size(PAGE_SIZE);
        meta.set_publication_window_length(params.term_window_length());
        meta.set_receiver_window_length(0);
        meta.set_socket_sndbuf_length(0);
        meta.set_socket_rcvbuf_length(0);
        meta.set_default_frame_header(&frame::default_frame_header(
            params.session_id,
            params.stream_id,
        ));
        meta.end_of_stream_position_release(i64::MAX);

        let starting_term_id = params.starting_term_id();
        let term_count = position::compute_term_count(starting_term_id, params.initial_term_id);
        let active_index = position::index_by_term_count(term_count);
        meta.tail_counter(active_index).store(
            position::pack_tail(starting_term_id, params.starting_term_offset()),
            std::sync::atomic::Ordering::Release,
        );
        meta.active_term_count_release(term_count);

        Ok(log)
    }

    /// Map an existing log for another role in the same or a different process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(&path).with_source(err))?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        if actual_size < LOG_META_DATA_LENGTH as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_path(&path)
                .with_message("log shorter than metadata"));
        }

        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };
        let base = mmap.as_mut_ptr();

        let log = Self {
            path,
            file,
            mmap,
            base,
            term_length: 0,
            owns_lock: false,
        };
        let log = log.validated(actual_size)?;
        Ok(log)
    }

    fn validated(mut self, actual_size: u64) -> Result<Self, Error> {
        // Metadata sits after the terms; recover term length from the file size
        // first, then cross-check it against the recorded value.
        let body = actual_size as usize - LOG_META_DATA_LENGTH;
        if body % PARTITION_COUNT != 0 {
            return Err(self.corrupt("log body is not three equal terms"));
        }
        self.term_length = body / PARTITION_COUNT;

        let meta = self.metadata();
        let term_length = meta.term_length();
        if term_length as usize != self.term_length {
            return Err(self.corrupt("term length mismatch"));
        }
        if term_length < TERM_MIN_LENGTH
            || term_length > TERM_MAX_LENGTH
            || (term_length & (term_length - 1)) != 0
        {
            return Err(self.corrupt("term length out of range"));
        }
        if meta.default_frame_header_length() != HEADER_LENGTH as i32 {
            return Err(self.corrupt("unsupported frame header length"));
        }
        if meta.mtu_length() <= HEADER_LENGTH as i32 || meta.mtu_length() > term_length / 8 {
            return Err(self.corrupt("mtu length out of range"));
        }
        if meta.page_size() != PAGE_SIZE {
            return Err(self.corrupt("unsupported page size"));
        }
        Ok(self)
    }

    fn corrupt(&self, message: &str) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_path(&self.path)
            .with_message(message.to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn log_length(&self) -> usize {
        self.mmap.len()
    }

    pub fn term(&self, partition_index: usize) -> TermBuffer<'_> {
        debug_assert!(partition_index < PARTITION_COUNT);
        unsafe {
            TermBuffer::new(
                self.base.add(partition_index * self.term_length),
                self.term_length,
            )
        }
    }

    pub fn metadata(&self) -> LogMetadata<'_> {
        unsafe { LogMetadata::new(self.base.add(PARTITION_COUNT * self.term_length)) }
    }

    /// Unmap and delete the file; the end of a publication's life.
    pub fn free(self) -> Result<(), Error> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))
    }
}

impl Drop for RawLog {
    fn drop(&mut self) {
        if self.owns_lock {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}

/// Prepare the next partition and make it active: seed its raw tail with the
/// next term id first (release), then bump the count so claimers move over.
/// The CAS keeps concurrent trippers from bumping twice.
pub fn rotate_log(meta: &LogMetadata<'_>, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id.wrapping_add(1);
    let next_term_count = current_term_count.wrapping_add(1);
    let next_index = position::index_by_term_count(next_term_count);

    meta.tail_counter(next_index).store(
        position::pack_tail(next_term_id, 0),
        std::sync::atomic::Ordering::Release,
    );
    meta.cas_active_term_count(current_term_count, next_term_count)
}

/// Zero one bounded block of the dirty region behind `position`, starting at
/// `clean_position`. Returns the new clean position. The first word of the
/// block is cleared last, with release ordering, so a reader racing into the
/// region never observes a half-zeroed frame header in front of stale bytes.
pub fn clean_range(
    log: &RawLog,
    clean_position: i64,
    position: i64,
    bits_to_shift: u32,
) -> i64 {
    if position <= clean_position {
        return clean_position;
    }

    let term_length = log.term_length();
    let dirty_index = position::index_by_position(clean_position, bits_to_shift);
    let term_offset = (clean_position & (term_length as i64 - 1)) as usize;
    let bytes_for_cleaning = (position - clean_position) as usize;
    let bytes_left_in_term = term_length - term_offset;
    let length = bytes_for_cleaning
        .min(bytes_left_in_term)
        .min(CLEAN_BLOCK_LENGTH_MAX);

    let term = log.term(dirty_index);
    if length > 8 {
        term.set_memory(term_offset + 8, length - 8, 0);
    }
    term.put_i64_release(term_offset, 0);

    clean_position + length as i64
}

fn create_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn open_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
