//! A journaled, size-bounded LRU store of multi-stream entries.
//!
//! Each entry has `value_count` byte streams on disk plus a line in an
//! append-only journal. Edits stage `.tmp` files that are renamed into
//! place atomically on commit, so readers only ever observe complete
//! entries. The journal is compacted in the background once redundant
//! records accumulate.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::task::{Task, TaskQueue, TaskRunner, DONE};

pub(crate) const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
pub(crate) const MAGIC: &str = "libcore.io.DiskLruCache";
pub(crate) const VERSION: &str = "1";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Compact once this many redundant journal lines accumulate (and they
/// outnumber the live entries).
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

fn key_is_valid(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 120
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

pub(crate) struct DiskLruCache {
    directory: PathBuf,
    app_version: u32,
    value_count: usize,
    state: Mutex<CacheState>,
    cleanup_queue: TaskQueue,
}

struct CacheState {
    initialized: bool,
    closed: bool,
    max_size: u64,
    size: u64,
    journal_writer: Option<BufWriter<File>>,
    entries: HashMap<String, Entry>,
    redundant_op_count: usize,
    next_sequence_number: u64,
    lru_clock: u64,
    has_journal_errors: bool,
}

#[derive(Debug)]
struct Entry {
    lengths: Vec<u64>,
    /// True once a CLEAN record published this entry.
    readable: bool,
    /// The id of the editor currently writing, if any.
    current_editor: Option<u64>,
    /// Scheduled for removal once its editor or readers let go.
    zombie: bool,
    sequence_number: u64,
    last_used: u64,
}

impl Entry {
    fn new(value_count: usize) -> Entry {
        Entry {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            zombie: false,
            sequence_number: 0,
            last_used: 0,
        }
    }
}

/// An atomically opened view of one entry's value streams.
pub(crate) struct Snapshot {
    pub(crate) key: String,
    pub(crate) sequence_number: u64,
    pub(crate) sources: Vec<File>,
    pub(crate) lengths: Vec<u64>,
}

/// Writes new values for one entry. Exactly one editor exists per key.
pub(crate) struct Editor {
    cache: Arc<DiskLruCache>,
    key: String,
    id: u64,
    /// Which value indices have been (at least) opened for write.
    written: Vec<bool>,
    finished: bool,
}

impl DiskLruCache {
    pub(crate) fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
        task_runner: &TaskRunner,
    ) -> Arc<DiskLruCache> {
        assert!(max_size > 0, "max_size must be positive");
        assert!(value_count > 0, "value_count must be positive");
        Arc::new(DiskLruCache {
            directory: directory.into(),
            app_version,
            value_count,
            state: Mutex::new(CacheState {
                initialized: false,
                closed: false,
                max_size,
                size: 0,
                journal_writer: None,
                entries: HashMap::new(),
                redundant_op_count: 0,
                next_sequence_number: 1,
                lru_clock: 0,
                has_journal_errors: false,
            }),
            cleanup_queue: task_runner.new_queue(),
        })
    }

    fn journal_path(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    fn clean_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}", key, index))
    }

    fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}.tmp", key, index))
    }

    /// Lazily initializes from disk, preferring the primary journal over
    /// the backup and rebuilding from scratch when both are hopeless.
    fn initialize(&self, state: &mut CacheState) -> io::Result<()> {
        if state.initialized {
            return Ok(());
        }
        fs::create_dir_all(&self.directory)?;

        let backup = self.directory.join(JOURNAL_FILE_BACKUP);
        if backup.exists() {
            if self.journal_path().exists() {
                let _ = fs::remove_file(&backup);
            } else {
                fs::rename(&backup, self.journal_path())?;
            }
        }

        if self.journal_path().exists() {
            match self.read_journal(state) {
                Ok(()) => {
                    self.process_journal(state)?;
                    state.initialized = true;
                    return Ok(());
                }
                Err(e) => {
                    warn!("journal of {:?} is corrupt, discarding: {}", self.directory, e);
                    self.delete_contents()?;
                    state.entries.clear();
                    state.size = 0;
                }
            }
        }

        self.rebuild_journal(state)?;
        state.initialized = true;
        Ok(())
    }

    fn read_journal(&self, state: &mut CacheState) -> io::Result<()> {
        let file = File::open(self.journal_path())?;
        let mut reader = BufReader::new(file);
        let magic = read_line(&mut reader)?;
        let version = read_line(&mut reader)?;
        let app_version = read_line(&mut reader)?;
        let value_count = read_line(&mut reader)?;
        let blank = read_line(&mut reader)?;
        if magic != MAGIC
            || version != VERSION
            || app_version != self.app_version.to_string()
            || value_count != self.value_count.to_string()
            || !blank.is_empty()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected journal header: [{}, {}, {}]", magic, version, blank),
            ));
        }

        let mut line_count = 0usize;
        loop {
            match read_line(&mut reader) {
                Ok(line) => {
                    self.read_journal_line(state, &line)?;
                    line_count += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        state.redundant_op_count = line_count - state.entries.len();

        // Reopen for appending.
        state.journal_writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(self.journal_path())?,
        ));
        Ok(())
    }

    fn read_journal_line(&self, state: &mut CacheState, line: &str) -> io::Result<()> {
        let mut parts = line.splitn(2, ' ');
        let op = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        match op {
            REMOVE => {
                state.entries.remove(rest);
                return Ok(());
            }
            CLEAN => {
                let mut fields = rest.split(' ');
                let key = fields.next().unwrap_or("").to_string();
                let lengths: Result<Vec<u64>, _> =
                    fields.map(|f| f.parse::<u64>()).collect();
                let lengths = lengths.map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "unexpected journal line")
                })?;
                if lengths.len() != self.value_count || !key_is_valid(&key) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected journal line",
                    ));
                }
                state.lru_clock += 1;
                let sequence = state.next_sequence_number;
                state.next_sequence_number += 1;
                let last_used = state.lru_clock;
                let entry = state
                    .entries
                    .entry(key)
                    .or_insert_with(|| Entry::new(self.value_count));
                entry.readable = true;
                entry.current_editor = None;
                entry.lengths = lengths;
                entry.sequence_number = sequence;
                entry.last_used = last_used;
            }
            DIRTY => {
                if !key_is_valid(rest) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected journal line",
                    ));
                }
                let entry = state
                    .entries
                    .entry(rest.to_string())
                    .or_insert_with(|| Entry::new(self.value_count));
                entry.current_editor = Some(u64::MAX); // recovered; no live editor
            }
            READ => {
                state.lru_clock += 1;
                let clock = state.lru_clock;
                if let Some(entry) = state.entries.get_mut(rest) {
                    entry.last_used = clock;
                } else if !key_is_valid(rest) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected journal line",
                    ));
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected journal line",
                ))
            }
        }
        Ok(())
    }

    /// Deletes stale dirty files and computes the live size. Entries
    /// without a CLEAN record are dropped.
    fn process_journal(&self, state: &mut CacheState) -> io::Result<()> {
        let _ = fs::remove_file(self.directory.join(JOURNAL_FILE_TMP));
        let mut size = 0u64;
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            let entry = state.entries.get_mut(&key).expect("key exists");
            if entry.current_editor.is_none() && entry.readable {
                for length in &entry.lengths {
                    size += length;
                }
            } else {
                state.entries.remove(&key);
                for index in 0..self.value_count {
                    let _ = fs::remove_file(self.clean_file(&key, index));
                    let _ = fs::remove_file(self.dirty_file(&key, index));
                }
            }
        }
        state.size = size;
        Ok(())
    }

    /// Writes a compact journal to `journal.tmp`, then renames it over
    /// the primary via the backup, so a crash never loses both.
    fn rebuild_journal(&self, state: &mut CacheState) -> io::Result<()> {
        if let Some(mut writer) = state.journal_writer.take() {
            let _ = writer.flush();
        }

        let tmp_path = self.directory.join(JOURNAL_FILE_TMP);
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writeln!(writer, "{}", MAGIC)?;
            writeln!(writer, "{}", VERSION)?;
            writeln!(writer, "{}", self.app_version)?;
            writeln!(writer, "{}", self.value_count)?;
            writeln!(writer)?;
            for (key, entry) in &state.entries {
                if entry.current_editor.is_some() {
                    writeln!(writer, "{} {}", DIRTY, key)?;
                } else if entry.readable {
                    let lengths: Vec<String> =
                        entry.lengths.iter().map(|l| l.to_string()).collect();
                    writeln!(writer, "{} {} {}", CLEAN, key, lengths.join(" "))?;
                }
            }
            writer.flush()?;
        }

        if self.journal_path().exists() {
            let backup = self.directory.join(JOURNAL_FILE_BACKUP);
            fs::rename(self.journal_path(), &backup)?;
            fs::rename(&tmp_path, self.journal_path())?;
            let _ = fs::remove_file(&backup);
        } else {
            fs::rename(&tmp_path, self.journal_path())?;
        }

        state.journal_writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(self.journal_path())?,
        ));
        state.redundant_op_count = 0;
        state.has_journal_errors = false;
        Ok(())
    }

    fn delete_contents(&self) -> io::Result<()> {
        if self.directory.exists() {
            for entry in fs::read_dir(&self.directory)? {
                let path = entry?.path();
                if path.is_file() {
                    let _ = fs::remove_file(path);
                }
            }
        }
        Ok(())
    }

    fn write_journal_line(state: &mut CacheState, line: String) {
        if let Some(ref mut writer) = state.journal_writer {
            let result = writeln!(writer, "{}", line).and_then(|()| writer.flush());
            if result.is_err() {
                state.has_journal_errors = true;
            }
        }
    }

    /// Returns a snapshot of the entry named `key`, or `None`.
    pub(crate) fn get(self: &Arc<Self>, key: &str) -> Option<Snapshot> {
        assert!(key_is_valid(key), "invalid cache key: {:?}", key);
        let mut state = self.state.lock().unwrap();
        if state.closed || self.initialize(&mut state).is_err() {
            return None;
        }

        let (sequence_number, lengths) = match state.entries.get(key) {
            Some(entry) if entry.readable && !entry.zombie => {
                (entry.sequence_number, entry.lengths.clone())
            }
            _ => return None,
        };

        // All sources open atomically, before any mutation can race.
        let mut sources = Vec::with_capacity(self.value_count);
        for index in 0..self.value_count {
            match File::open(self.clean_file(key, index)) {
                Ok(file) => sources.push(file),
                Err(_) => {
                    // The file vanished under us; drop the whole entry.
                    drop(sources);
                    self.remove_entry_locked(&mut state, key);
                    return None;
                }
            }
        }

        state.lru_clock += 1;
        let clock = state.lru_clock;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used = clock;
        }
        state.redundant_op_count += 1;
        Self::write_journal_line(&mut state, format!("{} {}", READ, key));
        if self.journal_rebuild_required(&state) {
            self.schedule_cleanup();
        }

        Some(Snapshot {
            key: key.to_string(),
            sequence_number,
            sources,
            lengths,
        })
    }

    /// Opens an editor for `key`. Returns `None` when another editor is
    /// active or when `expected_sequence` no longer matches.
    pub(crate) fn edit(
        self: &Arc<Self>,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Option<Editor> {
        assert!(key_is_valid(key), "invalid cache key: {:?}", key);
        let mut state = self.state.lock().unwrap();
        if state.closed || self.initialize(&mut state).is_err() {
            return None;
        }

        if let Some(expected) = expected_sequence {
            match state.entries.get(key) {
                Some(entry) if entry.readable && entry.sequence_number == expected => {}
                _ => return None,
            }
        }

        let editor_id = state.next_sequence_number;
        state.next_sequence_number += 1;
        {
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(self.value_count));
            if entry.current_editor.is_some() || entry.zombie {
                return None;
            }
            entry.current_editor = Some(editor_id);
        }
        state.redundant_op_count += 1;
        Self::write_journal_line(&mut state, format!("{} {}", DIRTY, key));

        Some(Editor {
            cache: self.clone(),
            key: key.to_string(),
            id: editor_id,
            written: vec![false; self.value_count],
            finished: false,
        })
    }

    /// Removes the entry if present. An entry mid-edit becomes a zombie
    /// and dies when its editor completes.
    pub(crate) fn remove(self: &Arc<Self>, key: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || self.initialize(&mut state).is_err() {
            return false;
        }
        match state.entries.get_mut(key) {
            Some(entry) if entry.current_editor.is_some() => {
                entry.zombie = true;
                true
            }
            Some(_) => {
                self.remove_entry_locked(&mut state, key);
                true
            }
            None => false,
        }
    }

    fn remove_entry_locked(&self, state: &mut CacheState, key: &str) {
        if let Some(entry) = state.entries.remove(key) {
            for index in 0..self.value_count {
                let _ = fs::remove_file(self.clean_file(key, index));
                state.size = state.size.saturating_sub(entry.lengths[index]);
            }
            state.redundant_op_count += 1;
            Self::write_journal_line(state, format!("{} {}", REMOVE, key));
        }
    }

    fn complete_edit(self: &Arc<Self>, editor: &Editor, success: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry_state = match state.entries.get(&editor.key) {
            Some(entry) if entry.current_editor == Some(editor.id) => {
                (entry.zombie, entry.readable)
            }
            _ => {
                // Superseded; discard whatever was staged.
                for index in 0..self.value_count {
                    let _ = fs::remove_file(self.dirty_file(&editor.key, index));
                }
                return false;
            }
        };
        let (zombie, was_readable) = entry_state;
        let success = success && !zombie;

        if success {
            // Publish: every dirty file moves to its clean name.
            let mut new_lengths = vec![0u64; self.value_count];
            let mut publish_failed = false;
            for index in 0..self.value_count {
                let dirty = self.dirty_file(&editor.key, index);
                let clean = self.clean_file(&editor.key, index);
                if editor.written[index] {
                    let length = fs::metadata(&dirty).map(|m| m.len()).unwrap_or(0);
                    if fs::rename(&dirty, &clean).is_err() {
                        publish_failed = true;
                        break;
                    }
                    new_lengths[index] = length;
                } else if was_readable {
                    new_lengths[index] = fs::metadata(&clean).map(|m| m.len()).unwrap_or(0);
                } else {
                    // A brand new entry must write every stream.
                    publish_failed = true;
                    break;
                }
            }

            if publish_failed {
                state.has_journal_errors = true;
                for index in 0..self.value_count {
                    let _ = fs::remove_file(self.dirty_file(&editor.key, index));
                }
                self.finish_failed_edit(&mut state, editor, was_readable);
                self.schedule_cleanup();
                return false;
            }

            let old_total: u64;
            let new_total: u64 = new_lengths.iter().sum();
            let sequence = state.next_sequence_number;
            state.next_sequence_number += 1;
            state.lru_clock += 1;
            let clock = state.lru_clock;
            {
                let entry = state.entries.get_mut(&editor.key).expect("entry exists");
                old_total = entry.lengths.iter().sum();
                entry.lengths = new_lengths;
                entry.readable = true;
                entry.current_editor = None;
                entry.sequence_number = sequence;
                entry.last_used = clock;
            }
            state.size = state.size - old_total + new_total;
            state.redundant_op_count += 1;
            let lengths: Vec<String> = state.entries[&editor.key]
                .lengths
                .iter()
                .map(|l| l.to_string())
                .collect();
            Self::write_journal_line(
                &mut state,
                format!("{} {} {}", CLEAN, editor.key, lengths.join(" ")),
            );
            if state.size > state.max_size || self.journal_rebuild_required(&state) {
                self.schedule_cleanup();
            }
            true
        } else {
            for index in 0..self.value_count {
                let _ = fs::remove_file(self.dirty_file(&editor.key, index));
            }
            if zombie {
                self.remove_entry_after_zombie(&mut state, editor);
            } else {
                self.finish_failed_edit(&mut state, editor, was_readable);
            }
            false
        }
    }

    fn finish_failed_edit(&self, state: &mut CacheState, editor: &Editor, was_readable: bool) {
        if was_readable {
            // The previous clean files remain authoritative.
            if let Some(entry) = state.entries.get_mut(&editor.key) {
                entry.current_editor = None;
            }
            state.redundant_op_count += 1;
            let lengths: Vec<String> = state.entries[&editor.key]
                .lengths
                .iter()
                .map(|l| l.to_string())
                .collect();
            Self::write_journal_line(
                state,
                format!("{} {} {}", CLEAN, editor.key, lengths.join(" ")),
            );
        } else {
            state.entries.remove(&editor.key);
            state.redundant_op_count += 1;
            Self::write_journal_line(state, format!("{} {}", REMOVE, editor.key));
        }
    }

    fn remove_entry_after_zombie(&self, state: &mut CacheState, editor: &Editor) {
        if let Some(entry) = state.entries.get_mut(&editor.key) {
            entry.current_editor = None;
        }
        self.remove_entry_locked(state, &editor.key);
    }

    fn journal_rebuild_required(&self, state: &CacheState) -> bool {
        state.has_journal_errors
            || (state.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
                && state.redundant_op_count >= state.entries.len())
    }

    /// Evicts least-recently-used entries until the size bound holds.
    fn trim_to_size(&self, state: &mut CacheState) {
        while state.size > state.max_size {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| e.readable && e.current_editor.is_none() && !e.zombie)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    debug!("evicting {} to honor size bound", key);
                    self.remove_entry_locked(state, &key);
                }
                None => break,
            }
        }
    }

    fn schedule_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.cleanup_queue.schedule(
            Task::new("cache cleanup", true, move || {
                let cache = match weak.upgrade() {
                    Some(cache) => cache,
                    None => return DONE,
                };
                let mut state = cache.state.lock().unwrap();
                if !state.initialized || state.closed {
                    return DONE;
                }
                cache.trim_to_size(&mut state);
                if cache.journal_rebuild_required(&state) {
                    if let Err(e) = cache.rebuild_journal(&mut state) {
                        warn!("journal rebuild failed: {}", e);
                    }
                }
                DONE
            }),
            0,
        );
    }

    pub(crate) fn size(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let _ = self.initialize(&mut state);
        state.size
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.state.lock().unwrap().max_size
    }

    /// Removes every entry. The journal survives.
    pub(crate) fn evict_all(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if self.initialize(&mut state).is_err() {
            return;
        }
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in keys {
            let has_editor = state
                .entries
                .get(&key)
                .map(|e| e.current_editor.is_some())
                .unwrap_or(false);
            if has_editor {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.zombie = true;
                }
            } else {
                self.remove_entry_locked(&mut state, &key);
            }
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(mut writer) = state.journal_writer.take() {
            let _ = writer.flush();
        }
        self.cleanup_queue.cancel_all();
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let _ = self.initialize(&mut state);
        state.entries.len()
    }
}

impl fmt::Debug for DiskLruCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLruCache")
            .field("directory", &self.directory)
            .finish()
    }
}

impl Editor {
    /// Opens the sink for value `index`, truncating any earlier staging.
    pub(crate) fn new_sink(&mut self, index: usize) -> io::Result<File> {
        assert!(!self.finished, "editor already finished");
        self.written[index] = true;
        File::create(self.cache.dirty_file(&self.key, index))
    }

    /// Publishes the staged values. False when superseded or failed.
    pub(crate) fn commit(mut self) -> bool {
        self.finished = true;
        self.cache.clone().complete_edit(&self, true)
    }

    /// Discards the staged values.
    pub(crate) fn abort(mut self) {
        self.finished = true;
        self.cache.clone().complete_edit(&self, false);
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.cache.clone().complete_edit(self, false);
        }
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Editor").field("key", &self.key).finish()
    }
}

fn read_line(reader: &mut BufReader<File>) -> io::Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of journal"));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRunner;
    use std::io::Read;
    use std::path::Path;

    fn journal_exists(directory: &Path) -> bool {
        directory.join(JOURNAL_FILE).exists()
    }

    fn new_cache(dir: &Path, max_size: u64) -> Arc<DiskLruCache> {
        DiskLruCache::open(dir, 1, 2, max_size, TaskRunner::global())
    }

    fn write_entry(cache: &Arc<DiskLruCache>, key: &str, v0: &[u8], v1: &[u8]) -> bool {
        let mut editor = cache.edit(key, None).expect("editor available");
        editor.new_sink(0).unwrap().write_all(v0).unwrap();
        editor.new_sink(1).unwrap().write_all(v1).unwrap();
        editor.commit()
    }

    fn read_value(snapshot: &mut Snapshot, index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        snapshot.sources[index].read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(write_entry(&cache, "k1", b"meta", b"body"));
        let mut snapshot = cache.get("k1").unwrap();
        assert_eq!(read_value(&mut snapshot, 0), b"meta");
        assert_eq!(read_value(&mut snapshot, 1), b"body");
        assert_eq!(snapshot.lengths, vec![4, 4]);
        assert_eq!(cache.size(), 8);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = new_cache(dir.path(), 1024);
            assert!(write_entry(&cache, "k1", b"aa", b"bbb"));
            cache.close();
        }
        let cache = new_cache(dir.path(), 1024);
        let mut snapshot = cache.get("k1").unwrap();
        assert_eq!(read_value(&mut snapshot, 1), b"bbb");
        assert_eq!(cache.size(), 5);
    }

    #[test]
    fn abort_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        let mut editor = cache.edit("k1", None).unwrap();
        editor.new_sink(0).unwrap().write_all(b"x").unwrap();
        editor.abort();
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.size(), 0);
        assert!(!dir.path().join("k1.0.tmp").exists());
        assert!(!dir.path().join("k1.0").exists());
    }

    #[test]
    fn abort_preserves_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(write_entry(&cache, "k1", b"old0", b"old1"));
        let mut editor = cache.edit("k1", None).unwrap();
        editor.new_sink(0).unwrap().write_all(b"new!").unwrap();
        editor.abort();
        let mut snapshot = cache.get("k1").unwrap();
        assert_eq!(read_value(&mut snapshot, 0), b"old0");
    }

    #[test]
    fn one_editor_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        let editor = cache.edit("k1", None).unwrap();
        assert!(cache.edit("k1", None).is_none());
        drop(editor);
        assert!(cache.edit("k1", None).is_some());
    }

    #[test]
    fn snapshot_sequence_guards_edit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(write_entry(&cache, "k1", b"v1", b"v1"));
        let snapshot = cache.get("k1").unwrap();

        // Entry mutates after the snapshot was taken.
        assert!(write_entry(&cache, "k1", b"v2", b"v2"));
        assert!(cache.edit("k1", Some(snapshot.sequence_number)).is_none());

        let fresh = cache.get("k1").unwrap();
        assert!(cache.edit("k1", Some(fresh.sequence_number)).is_some());
    }

    #[test]
    fn remove_during_edit_zombies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(write_entry(&cache, "k1", b"a", b"b"));
        let mut editor = cache.edit("k1", None).unwrap();
        editor.new_sink(0).unwrap().write_all(b"x").unwrap();
        editor.new_sink(1).unwrap().write_all(b"y").unwrap();
        // Concurrent remove wins; the commit loses.
        assert!(cache.remove("k1"));
        assert!(!editor.commit());
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn eviction_is_lru() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 20);
        assert!(write_entry(&cache, "k1", b"12345", b"12345"));
        assert!(write_entry(&cache, "k2", b"12345", b"12345"));
        // Touch k1 so k2 is the coldest.
        let _ = cache.get("k1").unwrap();
        assert!(write_entry(&cache, "k3", b"12345", b"12345"));
        {
            let mut state = cache.state.lock().unwrap();
            cache.trim_to_size(&mut state);
        }
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k2").is_none());
        assert!(cache.get("k3").is_some());
        assert!(cache.size() <= 20);
    }

    #[test]
    fn size_accounting_matches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(write_entry(&cache, "k1", b"123", b"4567"));
        assert!(write_entry(&cache, "k2", b"1", b"2"));
        assert!(write_entry(&cache, "k1", b"12", b"34"));
        assert_eq!(cache.size(), 2 + 2 + 1 + 1);
        assert!(cache.remove("k2"));
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn backup_journal_promoted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = new_cache(dir.path(), 1024);
            assert!(write_entry(&cache, "k1", b"a", b"b"));
            cache.close();
        }
        fs::rename(
            dir.path().join(JOURNAL_FILE),
            dir.path().join(JOURNAL_FILE_BACKUP),
        )
        .unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(cache.get("k1").is_some());
        assert!(journal_exists(dir.path()));
        assert!(!dir.path().join(JOURNAL_FILE_BACKUP).exists());
    }

    #[test]
    fn corrupt_journal_discards_cache() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = new_cache(dir.path(), 1024);
            assert!(write_entry(&cache, "k1", b"a", b"b"));
            cache.close();
        }
        fs::write(dir.path().join(JOURNAL_FILE), b"not a journal\n").unwrap();
        let cache = new_cache(dir.path(), 1024);
        assert!(cache.get("k1").is_none());
        // A fresh journal was rebuilt and the store works again.
        assert!(write_entry(&cache, "k2", b"c", b"d"));
        assert!(cache.get("k2").is_some());
    }

    #[test]
    fn no_orphaned_tmp_after_startup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = new_cache(dir.path(), 1024);
            assert!(write_entry(&cache, "k1", b"a", b"b"));
            // An editor left hanging at shutdown.
            let mut editor = cache.edit("k2", None).unwrap();
            editor.new_sink(0).unwrap().write_all(b"zz").unwrap();
            std::mem::forget(editor);
            cache.close();
        }
        let cache = new_cache(dir.path(), 1024);
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k2").is_none());
        assert!(!dir.path().join("k2.0.tmp").exists());
    }

    #[test]
    fn rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = new_cache(dir.path(), 1024);
        for bad in ["", "UPPER", "sp ace", &"x".repeat(121)] {
            assert!(
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cache.get(bad)))
                    .is_err(),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
