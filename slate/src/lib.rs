//! Local-first tabbed scratchpad: the document model, its key-value persistence and
//! the store that keeps the two reconciled.
//! The store owns the working copy; consumers get snapshots and issue commands.

pub mod markup {
    //! Markup inspection for opaque rich-text fragments, built on `nom`.
    //!
    //! Nothing here validates or sanitises markup. The only question answered is whether
    //! a fragment carries any visible text once its tags are gone.

    use nom::{
        IResult,
        bytes::complete::{is_not, tag_no_case},
        character::complete::{char, multispace0},
        combinator::{opt, recognize},
        sequence::tuple,
    };

    /// `<br>`, `<br/>`, `<br />` in any letter case.
    fn line_break(input: &str) -> IResult<&str, &str> {
        recognize(tuple((
            tag_no_case("<br"),
            multispace0,
            opt(char('/')),
            char('>'),
        )))(input)
    }

    /// Any `<...>` run. An unterminated `<` is left alone as text.
    fn any_tag(input: &str) -> IResult<&str, &str> {
        recognize(tuple((char('<'), opt(is_not(">")), char('>'))))(input)
    }

    fn strip_with(input: &str, markup: fn(&str) -> IResult<&str, &str>) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(pos) = rest.find('<') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos..];
            match markup(rest) {
                Ok((tail, _)) => rest = tail,
                Err(_) => {
                    out.push('<');
                    rest = &rest[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn strip_line_breaks(input: &str) -> String {
        strip_with(input, line_break)
    }

    pub fn strip_tags(input: &str) -> String {
        strip_with(input, any_tag)
    }

    /// Visible text of a fragment: line breaks dropped first, then every other tag, then trimmed.
    /// `<<br>x>` therefore collapses to nothing.
    pub fn plain_text(input: &str) -> String {
        strip_tags(&strip_line_breaks(input))
            .trim_matches(is_blank_char)
            .to_string()
    }

    /// True when the fragment has no visible text. Decides what gets persisted.
    pub fn is_empty_markup(content: &str) -> bool {
        content.is_empty() || plain_text(content).is_empty()
    }

    fn is_blank_char(c: char) -> bool {
        c.is_whitespace() || c == '\u{FEFF}'
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn line_break_variants_are_empty() {
            for fragment in ["", "<br>", "<BR/>", "<br />", " <br>\n<br/> ", "<div><br></div>"] {
                assert!(is_empty_markup(fragment), "{fragment:?} should be empty");
            }
        }

        #[test]
        fn visible_text_is_not_empty() {
            assert!(!is_empty_markup("hello"));
            assert!(!is_empty_markup("<p>hi</p>"));
            assert!(!is_empty_markup("<b> x </b><br>"));
            assert!(!is_empty_markup("&nbsp;"));
        }

        #[test]
        fn unterminated_angle_bracket_counts_as_text() {
            assert!(!is_empty_markup("<"));
            assert_eq!(plain_text("a < b"), "a < b");
        }

        #[test]
        fn passes_run_in_order() {
            assert_eq!(plain_text("<<br>x>"), "");
            assert_eq!(strip_tags("<<br>x>"), "x>");
        }

        #[test]
        fn whitespace_and_bom_are_trimmed() {
            assert!(is_empty_markup("<span>\u{FEFF}\u{00A0} </span>"));
            assert_eq!(plain_text("  <i>note</i> "), "note");
        }
    }
}

pub mod core {
    //! Document model: tabs, their rich-text bodies and their margin notes.
    //!
    //! Wire names follow the persisted layout (`marginNotes`, `activeTabId`) so blobs
    //! written by earlier builds keep loading.

    use crate::markup;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    pub const DEFAULT_TITLE: &str = "Untitled";
    pub const TAB_ID_PREFIX: &str = "tab";
    pub const NOTE_ID_PREFIX: &str = "note";

    const ID_SUFFIX_LEN: usize = 7;

    /* ------------------------------- IDs ------------------------------- */

    /// `<prefix>-<epoch millis>-<7 base36 chars>`. Collisions are only avoided probabilistically.
    pub fn new_id(prefix: &str) -> String {
        let millis = Utc::now().timestamp_millis();
        format!("{prefix}-{millis}-{}", base36_suffix(Uuid::new_v4().as_u128()))
    }

    fn base36_suffix(mut n: u128) -> String {
        const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut out = [b'0'; ID_SUFFIX_LEN];
        for slot in out.iter_mut().rev() {
            *slot = DIGITS[(n % 36) as usize];
            n /= 36;
        }
        out.iter().map(|&b| b as char).collect()
    }

    /// Trimmed title, or [`DEFAULT_TITLE`] when nothing is left.
    pub fn normalize_title(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn default_title() -> String {
        DEFAULT_TITLE.to_string()
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MarginNote {
        pub id: String,
        /// Opaque rich-text fragment.
        #[serde(default)]
        pub content: String,
    }

    impl MarginNote {
        pub fn new() -> Self {
            Self {
                id: new_id(NOTE_ID_PREFIX),
                content: String::new(),
            }
        }

        /// No visible text; such a note is never written to storage.
        pub fn is_blank(&self) -> bool {
            markup::is_empty_markup(&self.content)
        }
    }

    /// One sheet of the scratchpad.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Tab {
        pub id: String,
        /// Never empty; blank renames fall back to [`DEFAULT_TITLE`].
        #[serde(default = "default_title")]
        pub title: String,
        /// Opaque rich-text fragment.
        #[serde(default)]
        pub content: String,
        /// Insertion order. Deletion removes in place without reordering.
        #[serde(default)]
        pub margin_notes: Vec<MarginNote>,
    }

    impl Tab {
        pub fn new() -> Self {
            Self {
                id: new_id(TAB_ID_PREFIX),
                title: default_title(),
                content: String::new(),
                margin_notes: vec![],
            }
        }

        pub fn note_position(&self, note_id: &str) -> Option<usize> {
            self.margin_notes.iter().position(|n| n.id == note_id)
        }

        pub fn note(&self, note_id: &str) -> Result<&MarginNote, DomainError> {
            self.margin_notes
                .iter()
                .find(|n| n.id == note_id)
                .ok_or_else(|| DomainError::UnknownNote {
                    tab: self.id.clone(),
                    note: note_id.to_string(),
                })
        }

        pub fn note_mut(&mut self, note_id: &str) -> Option<&mut MarginNote> {
            self.margin_notes.iter_mut().find(|n| n.id == note_id)
        }

        pub fn prune_empty_notes(&mut self) {
            self.margin_notes.retain(|n| !n.is_blank());
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root. Once loaded, `tabs` is non-empty and `active_tab_id` names one of them.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TabsState {
        pub tabs: Vec<Tab>,
        #[serde(default)]
        pub active_tab_id: String,
    }

    impl TabsState {
        pub fn with_tab(tab: Tab) -> Self {
            Self {
                active_tab_id: tab.id.clone(),
                tabs: vec![tab],
            }
        }

        /// A single empty "Untitled" tab, active.
        pub fn fresh() -> Self {
            Self::with_tab(Tab::new())
        }

        pub fn position(&self, tab_id: &str) -> Option<usize> {
            self.tabs.iter().position(|t| t.id == tab_id)
        }

        pub fn tab(&self, tab_id: &str) -> Result<&Tab, DomainError> {
            self.tabs
                .iter()
                .find(|t| t.id == tab_id)
                .ok_or_else(|| DomainError::UnknownTab(tab_id.to_string()))
        }

        pub fn tab_mut(&mut self, tab_id: &str) -> Option<&mut Tab> {
            self.tabs.iter_mut().find(|t| t.id == tab_id)
        }

        pub fn active_tab(&self) -> Option<&Tab> {
            self.tabs.iter().find(|t| t.id == self.active_tab_id)
        }

        pub fn is_active(&self, tab_id: &str) -> bool {
            self.active_tab_id == tab_id
        }

        /// Restores the invariants a hand-edited or truncated blob may break: a dangling
        /// active pointer moves to the first tab and blank titles become the default.
        /// Returns whether anything changed.
        pub fn repair(&mut self) -> bool {
            let mut changed = false;
            if self.active_tab().is_none() {
                if let Some(first) = self.tabs.first() {
                    self.active_tab_id = first.id.clone();
                    changed = true;
                }
            }
            for tab in &mut self.tabs {
                if tab.title.trim().is_empty() {
                    tab.title = default_title();
                    changed = true;
                }
            }
            changed
        }

        pub fn prune_empty_notes(&mut self) {
            for tab in &mut self.tabs {
                tab.prune_empty_notes();
            }
        }

        /// The persisted projection: a copy with every empty margin note removed.
        /// `self` is left untouched.
        pub fn project(&self) -> TabsState {
            let mut cleaned = self.clone();
            cleaned.prune_empty_notes();
            cleaned
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("no tab with id {0}")]
        UnknownTab(String),
        #[error("no margin note {note} in tab {tab}")]
        UnknownNote { tab: String, note: String },
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_carry_prefix_millis_and_suffix() {
            let id = new_id(TAB_ID_PREFIX);
            let parts: Vec<&str> = id.split('-').collect();
            assert_eq!(parts.len(), 3, "unexpected id shape: {id}");
            assert_eq!(parts[0], "tab");
            assert!(parts[1].parse::<i64>().is_ok());
            assert_eq!(parts[2].len(), 7);
            assert!(
                parts[2]
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
            );
            assert_ne!(new_id(NOTE_ID_PREFIX), new_id(NOTE_ID_PREFIX));
        }

        #[test]
        fn base36_suffix_is_zero_padded() {
            assert_eq!(base36_suffix(0), "0000000");
            assert_eq!(base36_suffix(35), "000000z");
            assert_eq!(base36_suffix(36), "0000010");
        }

        #[test]
        fn titles_are_trimmed_and_never_empty() {
            assert_eq!(normalize_title(""), DEFAULT_TITLE);
            assert_eq!(normalize_title("  \t"), DEFAULT_TITLE);
            assert_eq!(normalize_title(" Ideas "), "Ideas");
        }

        #[test]
        fn projection_leaves_working_copy_alone() {
            let mut tab = Tab::new();
            tab.margin_notes = vec![
                MarginNote {
                    id: "n1".into(),
                    content: "<br>".into(),
                },
                MarginNote {
                    id: "n2".into(),
                    content: "hello".into(),
                },
            ];
            let state = TabsState::with_tab(tab);

            let projected = state.project();

            assert_eq!(state.tabs[0].margin_notes.len(), 2);
            let kept: Vec<&str> = projected.tabs[0]
                .margin_notes
                .iter()
                .map(|n| n.id.as_str())
                .collect();
            assert_eq!(kept, vec!["n2"]);
        }

        #[test]
        fn repair_fixes_dangling_pointer_and_blank_titles() {
            let mut tab = Tab::new();
            tab.title = " ".into();
            let mut state = TabsState {
                tabs: vec![tab],
                active_tab_id: "gone".into(),
            };

            assert!(state.repair());
            assert_eq!(state.active_tab_id, state.tabs[0].id);
            assert_eq!(state.tabs[0].title, DEFAULT_TITLE);
            assert!(!state.repair());
        }

        #[test]
        fn serialized_layout_uses_camel_case_fields() {
            let state = TabsState::fresh();
            let json = serde_json::to_value(&state).expect("serialize");
            assert!(json.get("activeTabId").is_some());
            assert!(json["tabs"][0].get("marginNotes").is_some());
        }

        #[test]
        fn missing_optional_fields_take_defaults() {
            let state: TabsState =
                serde_json::from_str(r#"{"tabs":[{"id":"t1"}],"activeTabId":"t1"}"#)
                    .expect("parse");
            assert_eq!(state.tabs[0].title, DEFAULT_TITLE);
            assert!(state.tabs[0].content.is_empty());
            assert!(state.tabs[0].margin_notes.is_empty());
        }

        #[test]
        fn strict_lookups_report_unknown_ids() {
            let state = TabsState::fresh();
            assert!(matches!(state.tab("nope"), Err(DomainError::UnknownTab(_))));
            let tab = state.active_tab().expect("active tab");
            assert!(matches!(
                tab.note("nope"),
                Err(DomainError::UnknownNote { .. })
            ));
        }
    }
}

pub mod storage {
    //! Key-value slots backing the document store.
    //!
    //! Each key holds one whole value. Writes overwrite; nothing is transactional.

    use std::{
        cell::RefCell,
        collections::BTreeMap,
        fs,
        io::{self, Write},
        path::{Path, PathBuf},
        rc::Rc,
    };

    #[derive(Debug, thiserror::Error)]
    pub enum StorageError {
        #[error("storage i/o failed for {key}: {source}")]
        Io {
            key: String,
            #[source]
            source: io::Error,
        },
        #[error("storage unavailable: {0}")]
        Unavailable(String),
        #[error("writing {key} needs {len} bytes, over the {limit} byte quota")]
        QuotaExceeded {
            key: String,
            len: usize,
            limit: usize,
        },
    }

    pub trait KeyValueStore {
        /// `Ok(None)` when the key has never been written or was removed.
        fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

        fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

        /// Removing an absent key succeeds.
        fn remove(&mut self, key: &str) -> Result<(), StorageError>;
    }

    /* ------------------------------ FileStore ------------------------------ */

    /// One file per key inside a data directory. Writes land atomically.
    #[derive(Debug, Clone)]
    pub struct FileStore {
        dir: PathBuf,
    }

    impl FileStore {
        /// Opens (creating if needed) the data directory.
        pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
            let dir = dir.into();
            fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
                key: dir.display().to_string(),
                source,
            })?;
            Ok(Self { dir })
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        pub fn path_for(&self, key: &str) -> PathBuf {
            self.dir.join(slot_file_name(key))
        }
    }

    fn slot_file_name(key: &str) -> String {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() || name.starts_with('.') {
            format!("_{name}")
        } else {
            name
        }
    }

    impl KeyValueStore for FileStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            match fs::read_to_string(self.path_for(key)) {
                Ok(value) => Ok(Some(value)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                }),
            }
        }

        fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
            let io_err = |source: io::Error| StorageError::Io {
                key: key.to_string(),
                source,
            };
            let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
            temp.write_all(value.as_bytes()).map_err(io_err)?;
            temp.persist(self.path_for(key))
                .map_err(|err| io_err(err.error))?;
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), StorageError> {
            match fs::remove_file(self.path_for(key)) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                }),
            }
        }
    }

    /* ----------------------------- MemoryStore ----------------------------- */

    #[derive(Debug, Default)]
    struct MemorySlots {
        entries: BTreeMap<String, String>,
        quota: Option<usize>,
        unavailable: bool,
        writes: Vec<(String, String)>,
    }

    /// In-process slots for tests and throwaway sessions. Clones share the same slots,
    /// so a handle kept outside a store sees everything the store writes.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        slots: Rc<RefCell<MemorySlots>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Writes fail with [`StorageError::QuotaExceeded`] once keys plus values would
        /// exceed `limit` bytes.
        pub fn with_quota(limit: usize) -> Self {
            let store = Self::default();
            store.slots.borrow_mut().quota = Some(limit);
            store
        }

        /// Places a value directly, bypassing quota and the write log.
        pub fn seed(&self, key: &str, value: &str) {
            self.slots
                .borrow_mut()
                .entries
                .insert(key.to_string(), value.to_string());
        }

        pub fn peek(&self, key: &str) -> Option<String> {
            self.slots.borrow().entries.get(key).cloned()
        }

        /// Every successful `set`, oldest first.
        pub fn writes(&self) -> Vec<(String, String)> {
            self.slots.borrow().writes.clone()
        }

        pub fn write_count(&self) -> usize {
            self.slots.borrow().writes.len()
        }

        /// Simulates storage going away: every operation fails until switched back.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.slots.borrow_mut().unavailable = unavailable;
        }

        fn check_available(slots: &MemorySlots) -> Result<(), StorageError> {
            if slots.unavailable {
                Err(StorageError::Unavailable("memory store is offline".into()))
            } else {
                Ok(())
            }
        }
    }

    impl KeyValueStore for MemoryStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            let slots = self.slots.borrow();
            Self::check_available(&slots)?;
            Ok(slots.entries.get(key).cloned())
        }

        fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
            let mut slots = self.slots.borrow_mut();
            Self::check_available(&slots)?;
            if let Some(limit) = slots.quota {
                let others: usize = slots
                    .entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                let len = others + key.len() + value.len();
                if len > limit {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        len,
                        limit,
                    });
                }
            }
            slots.entries.insert(key.to_string(), value.to_string());
            slots.writes.push((key.to_string(), value.to_string()));
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), StorageError> {
            let mut slots = self.slots.borrow_mut();
            Self::check_available(&slots)?;
            slots.entries.remove(key);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn file_store_round_trips_values() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut store = FileStore::open(tmp.path().join("data")).expect("open store");

            assert_eq!(store.get("nekomata-slate-tabs").expect("get"), None);
            store.set("nekomata-slate-tabs", "{}").expect("set");
            store.set("nekomata-slate-tabs", "{\"tabs\":[]}").expect("overwrite");
            assert_eq!(
                store.get("nekomata-slate-tabs").expect("get").as_deref(),
                Some("{\"tabs\":[]}")
            );

            store.remove("nekomata-slate-tabs").expect("remove");
            store.remove("nekomata-slate-tabs").expect("remove twice");
            assert_eq!(store.get("nekomata-slate-tabs").expect("get"), None);
        }

        #[test]
        fn file_store_keeps_keys_inside_its_directory() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FileStore::open(tmp.path()).expect("open store");

            let path = store.path_for("../escape/key");
            assert_eq!(path.parent(), Some(tmp.path()));
            assert_eq!(store.path_for("").file_name().and_then(|n| n.to_str()), Some("_"));
        }

        #[test]
        fn memory_store_clones_share_slots() {
            let observer = MemoryStore::new();
            let mut writer = observer.clone();

            writer.set("k", "v").expect("set");

            assert_eq!(observer.peek("k").as_deref(), Some("v"));
            assert_eq!(observer.write_count(), 1);
        }

        #[test]
        fn memory_store_enforces_quota() {
            let mut store = MemoryStore::with_quota(8);
            store.set("k", "1234").expect("fits");
            store.set("k", "1234567").expect("overwrite still fits");

            let err = store.set("k", "12345678").expect_err("over quota");
            assert!(matches!(err, StorageError::QuotaExceeded { limit: 8, .. }));
            assert_eq!(store.peek("k").as_deref(), Some("1234567"));
        }

        #[test]
        fn memory_store_can_go_offline() {
            let mut store = MemoryStore::new();
            store.seed("k", "v");
            store.set_unavailable(true);

            assert!(matches!(store.get("k"), Err(StorageError::Unavailable(_))));
            assert!(store.set("k", "w").is_err());

            store.set_unavailable(false);
            assert_eq!(store.get("k").expect("get").as_deref(), Some("v"));
        }
    }
}

pub mod debounce {
    //! Trailing-edge debounce with caller-supplied time. No timers or threads are involved;
    //! the owner polls with [`Debouncer::take_due`].

    use std::time::{Duration, Instant};

    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(400);

    /// Holds at most one pending value. Each schedule replaces the value and restarts the delay.
    #[derive(Debug)]
    pub struct Debouncer<T> {
        delay: Duration,
        pending: Option<(Instant, T)>,
    }

    impl<T> Default for Debouncer<T> {
        fn default() -> Self {
            Self::new(DEFAULT_DEBOUNCE)
        }
    }

    impl<T> Debouncer<T> {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                pending: None,
            }
        }

        pub fn delay(&self) -> Duration {
            self.delay
        }

        pub fn schedule_at(&mut self, value: T, now: Instant) {
            self.pending = Some((now + self.delay, value));
        }

        pub fn schedule(&mut self, value: T) {
            self.schedule_at(value, Instant::now());
        }

        pub fn next_deadline(&self) -> Option<Instant> {
            self.pending.as_ref().map(|(deadline, _)| *deadline)
        }

        pub fn is_pending(&self) -> bool {
            self.pending.is_some()
        }

        /// Yields the pending value once its deadline has passed.
        pub fn take_due(&mut self, now: Instant) -> Option<T> {
            let due = matches!(self.pending, Some((deadline, _)) if deadline <= now);
            if due { self.take() } else { None }
        }

        /// Yields the pending value regardless of its deadline.
        pub fn take(&mut self) -> Option<T> {
            self.pending.take().map(|(_, value)| value)
        }

        /// Drops the pending value. Returns whether there was one.
        pub fn cancel(&mut self) -> bool {
            self.pending.take().is_some()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn rapid_calls_collapse_into_last_value() {
            let mut debouncer = Debouncer::new(Duration::from_millis(400));
            let base = Instant::now();

            debouncer.schedule_at("a", base);
            debouncer.schedule_at("ab", base + Duration::from_millis(100));

            assert_eq!(debouncer.take_due(base + Duration::from_millis(450)), None);
            assert_eq!(
                debouncer.take_due(base + Duration::from_millis(500)),
                Some("ab")
            );
            assert_eq!(debouncer.take_due(base + Duration::from_secs(10)), None);
        }

        #[test]
        fn each_schedule_restarts_the_delay() {
            let mut debouncer = Debouncer::new(Duration::from_millis(10));
            let base = Instant::now();

            debouncer.schedule_at(1, base);
            assert_eq!(debouncer.next_deadline(), Some(base + Duration::from_millis(10)));

            debouncer.schedule_at(2, base + Duration::from_millis(5));
            assert_eq!(debouncer.next_deadline(), Some(base + Duration::from_millis(15)));
        }

        #[test]
        fn take_and_cancel_clear_pending() {
            let mut debouncer = Debouncer::default();
            assert_eq!(debouncer.delay(), DEFAULT_DEBOUNCE);

            debouncer.schedule("x");
            assert!(debouncer.is_pending());
            assert_eq!(debouncer.take(), Some("x"));
            assert!(!debouncer.is_pending());

            debouncer.schedule("y");
            assert!(debouncer.cancel());
            assert!(!debouncer.cancel());
            assert_eq!(debouncer.next_deadline(), None);
        }
    }
}

pub mod migrate {
    //! Schema-versioned loading.
    //!
    //! Strategies run in order until one applies:
    //! 1. the current tabs blob,
    //! 2. the legacy single-document layout (migrated into one tab, then removed),
    //! 3. a fresh single-tab default.
    //! A strategy error stops the chain; the caller decides how to recover.

    use crate::core::{MarginNote, Tab, TabsState};
    use crate::storage::{KeyValueStore, StorageError};
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info, warn};

    pub const TABS_KEY: &str = "nekomata-slate-tabs";
    pub const LEGACY_DOCUMENT_KEY: &str = "nekomata-slate";
    pub const LEGACY_NOTES_KEY: &str = "nekomata-slate-margins";

    /// Storage key names. Injectable so tests and parallel profiles stay isolated.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct StorageKeys {
        pub tabs: String,
        pub legacy_document: String,
        pub legacy_notes: String,
    }

    impl Default for StorageKeys {
        fn default() -> Self {
            Self {
                tabs: TABS_KEY.into(),
                legacy_document: LEGACY_DOCUMENT_KEY.into(),
                legacy_notes: LEGACY_NOTES_KEY.into(),
            }
        }
    }

    impl StorageKeys {
        /// Same layout with every key prefixed, e.g. for a second profile.
        pub fn prefixed(prefix: &str) -> Self {
            let base = Self::default();
            Self {
                tabs: format!("{prefix}{}", base.tabs),
                legacy_document: format!("{prefix}{}", base.legacy_document),
                legacy_notes: format!("{prefix}{}", base.legacy_notes),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LoadOrigin {
        /// Read from the current key; not written back.
        Current,
        /// Built from the legacy keys.
        Migrated,
        /// Nothing stored yet.
        Fresh,
        /// Stored data could not be read; storage was left as found.
        Recovered,
    }

    impl LoadOrigin {
        pub fn needs_persist(self) -> bool {
            matches!(self, LoadOrigin::Migrated | LoadOrigin::Fresh)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Loaded {
        pub state: TabsState,
        pub origin: LoadOrigin,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum LoadError {
        #[error(transparent)]
        Storage(#[from] StorageError),
        #[error("failed to parse {key}: {source}")]
        Parse {
            key: String,
            #[source]
            source: serde_json::Error,
        },
        #[error("{key} holds no tabs")]
        NoTabs { key: String },
    }

    pub trait LoadStrategy {
        fn name(&self) -> &'static str;

        /// `Ok(None)` when this strategy has nothing to load from.
        fn attempt(
            &self,
            backend: &mut dyn KeyValueStore,
            keys: &StorageKeys,
        ) -> Result<Option<Loaded>, LoadError>;
    }

    /// Reads a key, treating an empty value like an absent one.
    fn read_non_empty(
        backend: &dyn KeyValueStore,
        key: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(backend.get(key)?.filter(|value| !value.is_empty()))
    }

    /* --------------------------- Current layout --------------------------- */

    pub struct CurrentLayout;

    impl LoadStrategy for CurrentLayout {
        fn name(&self) -> &'static str {
            "current"
        }

        fn attempt(
            &self,
            backend: &mut dyn KeyValueStore,
            keys: &StorageKeys,
        ) -> Result<Option<Loaded>, LoadError> {
            let Some(raw) = read_non_empty(backend, &keys.tabs)? else {
                return Ok(None);
            };
            let mut state: TabsState =
                serde_json::from_str(&raw).map_err(|source| LoadError::Parse {
                    key: keys.tabs.clone(),
                    source,
                })?;
            if state.tabs.is_empty() {
                return Err(LoadError::NoTabs {
                    key: keys.tabs.clone(),
                });
            }
            // Older builds could leave empty notes behind.
            state.prune_empty_notes();
            if state.repair() {
                warn!(key = %keys.tabs, "repaired stored tabs state");
            }
            Ok(Some(Loaded {
                state,
                origin: LoadOrigin::Current,
            }))
        }
    }

    /* ---------------------------- Legacy layout ---------------------------- */

    /// A bare document string plus a bare JSON array of notes.
    pub struct LegacyLayout;

    impl LoadStrategy for LegacyLayout {
        fn name(&self) -> &'static str {
            "legacy"
        }

        fn attempt(
            &self,
            backend: &mut dyn KeyValueStore,
            keys: &StorageKeys,
        ) -> Result<Option<Loaded>, LoadError> {
            let document = read_non_empty(backend, &keys.legacy_document)?;
            let notes = read_non_empty(backend, &keys.legacy_notes)?;
            if document.is_none() && notes.is_none() {
                return Ok(None);
            }

            let margin_notes: Vec<MarginNote> = match notes {
                Some(raw) => serde_json::from_str(&raw).map_err(|source| LoadError::Parse {
                    key: keys.legacy_notes.clone(),
                    source,
                })?,
                None => vec![],
            };

            let mut tab = Tab::new();
            tab.content = document.unwrap_or_default();
            tab.margin_notes = margin_notes;

            // The migrated tab is persisted right after this; a failed removal only means
            // the legacy slots get migrated again if that write is lost too.
            for key in [&keys.legacy_document, &keys.legacy_notes] {
                if let Err(err) = backend.remove(key) {
                    warn!(%key, "failed to remove legacy slot: {err}");
                }
            }
            info!(
                notes = tab.margin_notes.len(),
                "migrated legacy document into a tab"
            );

            Ok(Some(Loaded {
                state: TabsState::with_tab(tab),
                origin: LoadOrigin::Migrated,
            }))
        }
    }

    /* ------------------------------- Default ------------------------------- */

    pub struct FreshDefault;

    impl LoadStrategy for FreshDefault {
        fn name(&self) -> &'static str {
            "fresh"
        }

        fn attempt(
            &self,
            _backend: &mut dyn KeyValueStore,
            _keys: &StorageKeys,
        ) -> Result<Option<Loaded>, LoadError> {
            Ok(Some(Loaded {
                state: TabsState::fresh(),
                origin: LoadOrigin::Fresh,
            }))
        }
    }

    pub fn default_chain() -> Vec<Box<dyn LoadStrategy>> {
        vec![
            Box::new(CurrentLayout),
            Box::new(LegacyLayout),
            Box::new(FreshDefault),
        ]
    }

    /// Runs `strategies` in order. An exhausted chain still yields a fresh default.
    pub fn run_chain(
        strategies: &[Box<dyn LoadStrategy>],
        backend: &mut dyn KeyValueStore,
        keys: &StorageKeys,
    ) -> Result<Loaded, LoadError> {
        for strategy in strategies {
            if let Some(loaded) = strategy.attempt(backend, keys)? {
                debug!(
                    strategy = strategy.name(),
                    tabs = loaded.state.tabs.len(),
                    "loaded tabs state"
                );
                return Ok(loaded);
            }
        }
        Ok(Loaded {
            state: TabsState::fresh(),
            origin: LoadOrigin::Fresh,
        })
    }

}

pub mod store {
    //! The document store: sole owner of [`TabsState`].
    //!
    //! Every command mutates the in-memory copy first. Persistence writes the pruned
    //! projection, either at once (deletions, tab creation, tab switches) or through the
    //! debouncer (content and title edits). Storage failures are logged and dropped;
    //! unknown ids are no-ops.

    use crate::core::{MarginNote, Tab, TabsState, normalize_title};
    use crate::debounce::{DEFAULT_DEBOUNCE, Debouncer};
    use crate::markup::is_empty_markup;
    use crate::migrate::{self, LoadOrigin, LoadStrategy, Loaded, StorageKeys};
    use crate::storage::KeyValueStore;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StoreOptions {
        pub keys: StorageKeys,
        pub debounce: Duration,
    }

    impl Default for StoreOptions {
        fn default() -> Self {
            Self {
                keys: StorageKeys::default(),
                debounce: DEFAULT_DEBOUNCE,
            }
        }
    }

    pub struct DocumentStore<S: KeyValueStore> {
        backend: S,
        keys: StorageKeys,
        state: TabsState,
        /// Serialized projection waiting for its debounce deadline.
        pending: Debouncer<String>,
        strategies: Vec<Box<dyn LoadStrategy>>,
        origin: Option<LoadOrigin>,
    }

    impl<S: KeyValueStore> DocumentStore<S> {
        pub fn new(backend: S, options: StoreOptions) -> Self {
            Self {
                backend,
                keys: options.keys,
                state: TabsState::default(),
                pending: Debouncer::new(options.debounce),
                strategies: migrate::default_chain(),
                origin: None,
            }
        }

        /// Replaces the load chain.
        pub fn with_strategies(mut self, strategies: Vec<Box<dyn LoadStrategy>>) -> Self {
            self.strategies = strategies;
            self
        }

        /* ------------------------------ Queries ------------------------------ */

        pub fn state(&self) -> &TabsState {
            &self.state
        }

        pub fn snapshot(&self) -> TabsState {
            self.state.clone()
        }

        pub fn active_tab(&self) -> Option<&Tab> {
            self.state.active_tab()
        }

        pub fn can_close_tab(&self) -> bool {
            self.state.tabs.len() > 1
        }

        /// How the last [`load`](Self::load) obtained its state; `None` before loading.
        pub fn load_origin(&self) -> Option<LoadOrigin> {
            self.origin
        }

        pub fn has_pending_write(&self) -> bool {
            self.pending.is_pending()
        }

        pub fn next_write_deadline(&self) -> Option<Instant> {
            self.pending.next_deadline()
        }

        pub fn keys(&self) -> &StorageKeys {
            &self.keys
        }

        pub fn backend(&self) -> &S {
            &self.backend
        }

        /* ---------------------------- Load/persist ---------------------------- */

        /// Loads (or migrates, or creates) the canonical state. Never fails: unreadable
        /// storage yields a fresh default and storage is left as found.
        pub fn load(&mut self) -> TabsState {
            self.flush();
            let loaded = match migrate::run_chain(&self.strategies, &mut self.backend, &self.keys)
            {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(key = %self.keys.tabs, "could not load saved tabs, starting fresh: {err}");
                    Loaded {
                        state: TabsState::fresh(),
                        origin: LoadOrigin::Recovered,
                    }
                }
            };
            self.state = loaded.state;
            self.origin = Some(loaded.origin);
            if loaded.origin.needs_persist() {
                self.persist(true);
            }
            self.state.clone()
        }

        pub fn persist(&mut self, immediate: bool) {
            self.persist_at(immediate, Instant::now());
        }

        /// Serializes the projection and writes it now, or schedules it relative to `now`.
        /// An immediate write supersedes whatever was pending.
        pub fn persist_at(&mut self, immediate: bool, now: Instant) {
            let payload = match serde_json::to_string(&self.state.project()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("failed to serialize tabs state: {err}");
                    return;
                }
            };
            if immediate {
                self.pending.cancel();
                self.write(&payload);
            } else {
                self.pending.schedule_at(payload, now);
            }
        }

        /// Performs the pending debounced write if its deadline has passed.
        pub fn tick_at(&mut self, now: Instant) -> bool {
            match self.pending.take_due(now) {
                Some(payload) => {
                    self.write(&payload);
                    true
                }
                None => false,
            }
        }

        pub fn tick(&mut self) -> bool {
            self.tick_at(Instant::now())
        }

        /// Performs the pending debounced write now, if any.
        pub fn flush(&mut self) -> bool {
            match self.pending.take() {
                Some(payload) => {
                    self.write(&payload);
                    true
                }
                None => false,
            }
        }

        fn write(&mut self, payload: &str) {
            match self.backend.set(&self.keys.tabs, payload) {
                Ok(()) => debug!(key = %self.keys.tabs, bytes = payload.len(), "persisted tabs"),
                Err(err) => warn!(key = %self.keys.tabs, "dropping tabs write: {err}"),
            }
        }

        /* ------------------------------- Tabs ------------------------------- */

        pub fn create_tab(&mut self) -> Tab {
            let tab = Tab::new();
            self.state.tabs.push(tab.clone());
            self.state.active_tab_id = tab.id.clone();
            self.persist(true);
            tab
        }

        /// The last tab cannot be deleted. Deleting the active tab activates the tab that
        /// slid into its slot, or the new last tab.
        pub fn delete_tab(&mut self, tab_id: &str) {
            if self.state.tabs.len() <= 1 {
                return;
            }
            let Some(index) = self.state.position(tab_id) else {
                return;
            };
            self.state.tabs.remove(index);
            if self.state.is_active(tab_id) {
                let next = index.min(self.state.tabs.len() - 1);
                self.state.active_tab_id = self.state.tabs[next].id.clone();
            }
            self.persist(true);
        }

        pub fn set_active_tab(&mut self, tab_id: &str) {
            if self.state.is_active(tab_id) || self.state.position(tab_id).is_none() {
                return;
            }
            self.state.active_tab_id = tab_id.to_string();
            self.persist(true);
        }

        pub fn update_tab_title(&mut self, tab_id: &str, title: &str) {
            let Some(tab) = self.state.tab_mut(tab_id) else {
                return;
            };
            tab.title = normalize_title(title);
            self.persist(false);
        }

        pub fn update_tab_content(&mut self, tab_id: &str, content: &str) {
            let Some(tab) = self.state.tab_mut(tab_id) else {
                return;
            };
            tab.content = content.to_string();
            self.persist(false);
        }

        /* --------------------------- Margin notes --------------------------- */

        /// Appends an empty note. Nothing is written until it gains content.
        pub fn create_margin_note(&mut self, tab_id: &str) -> MarginNote {
            let note = MarginNote::new();
            if let Some(tab) = self.state.tab_mut(tab_id) {
                tab.margin_notes.push(note.clone());
            }
            note
        }

        pub fn update_margin_note(&mut self, tab_id: &str, note_id: &str, content: &str) {
            let Some(note) = self
                .state
                .tab_mut(tab_id)
                .and_then(|tab| tab.note_mut(note_id))
            else {
                return;
            };
            note.content = content.to_string();
            if !is_empty_markup(content) {
                self.persist(false);
            }
        }

        /// Removes the note and writes at once. Returns the note to focus next: the one
        /// before it, else the one that took its place.
        pub fn delete_margin_note(&mut self, tab_id: &str, note_id: &str) -> Option<String> {
            let tab = self.state.tab_mut(tab_id)?;
            let index = tab.note_position(note_id)?;
            tab.margin_notes.remove(index);
            let focus = tab
                .margin_notes
                .get(index.saturating_sub(1))
                .map(|n| n.id.clone());
            self.persist(true);
            focus
        }

        /// Blur/backspace policy: deletes the note only when it has no visible text.
        pub fn discard_note_if_empty(&mut self, tab_id: &str, note_id: &str) -> bool {
            let empty = self
                .state
                .tab(tab_id)
                .ok()
                .and_then(|tab| tab.note(note_id).ok())
                .is_some_and(MarginNote::is_blank);
            if empty {
                self.delete_margin_note(tab_id, note_id);
            }
            empty
        }
    }

    impl<S: KeyValueStore> Drop for DocumentStore<S> {
        fn drop(&mut self) {
            self.flush();
        }
    }

}

pub mod config {
    //! Runtime configuration: where data lives, key names, debounce delay, log level.
    //!
    //! Read from an optional JSON file (`slate.json` in the data directory unless a path
    //! is given). Missing fields take defaults.

    use crate::debounce::DEFAULT_DEBOUNCE;
    use crate::migrate::StorageKeys;
    use crate::store::StoreOptions;
    use serde::{Deserialize, Serialize};
    use std::{
        fs, io,
        path::{Path, PathBuf},
        time::Duration,
    };

    pub const CONFIG_FILE_NAME: &str = "slate.json";
    pub const DATA_DIR_ENV: &str = "SLATE_DATA_DIR";
    pub const DEFAULT_DATA_DIR: &str = ".slate";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SlateConfig {
        pub data_dir: PathBuf,
        pub debounce_ms: u64,
        pub keys: StorageKeys,
        /// `tracing` filter directive used when `RUST_LOG` is unset.
        pub log_level: String,
    }

    impl Default for SlateConfig {
        fn default() -> Self {
            Self {
                data_dir: std::env::var_os(DATA_DIR_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
                debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
                keys: StorageKeys::default(),
                log_level: "warn".into(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read config {path:?}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to parse config {path:?}: {source}")]
        Parse {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
    }

    impl SlateConfig {
        pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }

        /// Reads `slate.json` from `data_dir`. `Ok(None)` when there is no such file.
        /// The returned config always points at `data_dir`.
        pub fn from_dir(data_dir: &Path) -> Result<Option<Self>, ConfigError> {
            let path = data_dir.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(None);
            }
            let mut config = Self::from_path(&path)?;
            config.data_dir = data_dir.to_path_buf();
            Ok(Some(config))
        }

        pub fn debounce(&self) -> Duration {
            Duration::from_millis(self.debounce_ms)
        }

        pub fn store_options(&self) -> StoreOptions {
            StoreOptions {
                keys: self.keys.clone(),
                debounce: self.debounce(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn partial_file_keeps_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("custom.json");
            fs::write(&path, r#"{"debounce_ms": 50, "keys": {"tabs": "scratch-tabs"}}"#)
                .expect("write config");

            let config = SlateConfig::from_path(&path).expect("load config");

            assert_eq!(config.debounce(), Duration::from_millis(50));
            assert_eq!(config.keys.tabs, "scratch-tabs");
            assert_eq!(config.keys.legacy_document, StorageKeys::default().legacy_document);
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.store_options().keys.tabs, "scratch-tabs");
        }

        #[test]
        fn missing_file_in_dir_is_not_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert_eq!(SlateConfig::from_dir(tmp.path()).expect("no config"), None);
        }

        #[test]
        fn dir_config_points_at_its_directory() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(
                tmp.path().join(CONFIG_FILE_NAME),
                r#"{"data_dir": "/elsewhere", "log_level": "debug"}"#,
            )
            .expect("write config");

            let config = SlateConfig::from_dir(tmp.path())
                .expect("load")
                .expect("present");

            assert_eq!(config.data_dir, tmp.path());
            assert_eq!(config.log_level, "debug");
        }

        #[test]
        fn malformed_file_reports_parse_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join(CONFIG_FILE_NAME);
            fs::write(&path, "{ nope").expect("write config");

            assert!(matches!(
                SlateConfig::from_path(&path),
                Err(ConfigError::Parse { .. })
            ));
            assert!(matches!(
                SlateConfig::from_path(&tmp.path().join("absent.json")),
                Err(ConfigError::Read { .. })
            ));
        }
    }
}

pub mod telemetry {
    //! Log output for the binary: `tracing` events to stderr.

    use tracing_subscriber::EnvFilter;

    /// `RUST_LOG` wins; otherwise `debug` when verbose, else `default_level`.
    /// Safe to call more than once; later calls are ignored.
    pub fn init(default_level: &str, verbose: bool) {
        let fallback = if verbose { "debug" } else { default_level };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

pub use crate::config::SlateConfig;
pub use crate::core::{MarginNote, Tab, TabsState};
pub use crate::migrate::{LoadOrigin, StorageKeys};
pub use crate::storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use crate::store::{DocumentStore, StoreOptions};
