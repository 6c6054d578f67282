//! The mutable session context merged into every outgoing event.

use std::collections::{BTreeMap, VecDeque};

use serde_json::{json, Map, Value};

use crate::event::{Breadcrumb, Document, Level};

/// Default capacity of the breadcrumb ring.
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

/// Session state that travels with every event: a bounded trail of
/// breadcrumbs plus tags, extras and release metadata.
///
/// The scope never sends anything itself; [`Scope::apply_to_event`]
/// merges it into an event document at capture time. Fields the event
/// already carries win over the scope's.
#[derive(Debug, Clone)]
pub struct Scope {
    breadcrumbs: VecDeque<Breadcrumb>,
    max_breadcrumbs: usize,
    tags: BTreeMap<String, String>,
    extra: BTreeMap<String, Value>,
    user: Option<String>,
    transaction: Option<String>,
    release: Option<String>,
    level: Level,
}

impl Default for Scope {
    fn default() -> Scope {
        Scope::new()
    }
}

impl Scope {
    /// A scope pre-populated with the default tags: the login name as
    /// `user_login` and the hostname as `server_name`, when available.
    pub fn new() -> Scope {
        let mut scope = Scope::empty();
        scope.set_default_tags();
        scope
    }

    /// A scope with no tags at all.
    pub fn empty() -> Scope {
        Scope {
            breadcrumbs: VecDeque::new(),
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            tags: BTreeMap::new(),
            extra: BTreeMap::new(),
            user: None,
            transaction: None,
            release: None,
            level: Level::Info,
        }
    }

    fn set_default_tags(&mut self) {
        if let Some(login) = login_name() {
            self.set_tag("user_login", &login);
        }
        if let Ok(hostname) = nix::unistd::gethostname() {
            self.set_tag("server_name", &hostname.to_string_lossy());
        }
    }

    pub fn set_max_breadcrumbs(&mut self, max_breadcrumbs: usize) {
        self.max_breadcrumbs = max_breadcrumbs;
        while self.breadcrumbs.len() > self.max_breadcrumbs {
            self.breadcrumbs.pop_front();
        }
    }

    /// Push a breadcrumb, evicting the oldest when over capacity.
    pub fn add_breadcrumb(&mut self, crumb: Breadcrumb) {
        self.breadcrumbs.push_back(crumb);
        while self.breadcrumbs.len() > self.max_breadcrumbs {
            self.breadcrumbs.pop_front();
        }
    }

    pub fn clear_breadcrumbs(&mut self) {
        self.breadcrumbs.clear();
    }

    /// Reset the scope to its initial state, default tags included.
    pub fn clear(&mut self) {
        let max_breadcrumbs = self.max_breadcrumbs;
        *self = Scope::new();
        self.max_breadcrumbs = max_breadcrumbs;
    }

    /// Set a tag; an empty value removes the key instead.
    pub fn set_tag(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.tags.remove(key);
        } else {
            self.tags.insert(key.to_owned(), value.to_owned());
        }
    }

    /// Merge a batch of tags over the existing ones.
    pub fn set_tags(&mut self, tags: BTreeMap<String, String>) {
        self.tags.extend(tags);
    }

    pub fn remove_tag(&mut self, key: &str) {
        self.tags.remove(key);
    }

    /// Set an extra; an empty value removes the key instead.
    pub fn set_extra(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.extra.remove(key);
        } else {
            self.extra.insert(key.to_owned(), json!(value));
        }
    }

    /// Merge a batch of extras over the existing ones.
    pub fn set_extras(&mut self, extras: Map<String, Value>) {
        self.extra.extend(extras);
    }

    pub fn remove_extra(&mut self, key: &str) {
        self.extra.remove(key);
    }

    pub fn set_user(&mut self, user: &str) {
        self.user = some_unless_empty(user);
    }

    pub fn set_transaction(&mut self, transaction: &str) {
        self.transaction = some_unless_empty(transaction);
    }

    pub fn set_release(&mut self, release: &str) {
        self.release = some_unless_empty(release);
    }

    pub fn set_level(&mut self, level: Level) {
        self.level = level;
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn release(&self) -> Option<&str> {
        self.release.as_deref()
    }

    pub fn transaction(&self) -> Option<&str> {
        self.transaction.as_deref()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn extra(&self) -> &BTreeMap<String, Value> {
        &self.extra
    }

    pub fn breadcrumbs(&self) -> impl Iterator<Item = &Breadcrumb> {
        self.breadcrumbs.iter()
    }

    /// Merge the scope into an event document.
    ///
    /// Only keys the event does not already carry are filled in; in
    /// particular an event with its own `level` keeps it, the scope's
    /// level is just the fallback. Empty collections are left out
    /// entirely. The `user` field is held on the scope but not merged.
    pub fn apply_to_event(&self, doc: &mut Document) {
        if !self.breadcrumbs.is_empty() {
            doc.entry("breadcrumbs".to_owned())
                .or_insert_with(|| json!({ "values": self.breadcrumbs }));
        }
        if !self.tags.is_empty() {
            doc.entry("tags".to_owned())
                .or_insert_with(|| json!(self.tags));
        }
        if !self.extra.is_empty() {
            doc.entry("extra".to_owned())
                .or_insert_with(|| json!(self.extra));
        }
        if let Some(transaction) = &self.transaction {
            doc.entry("transaction".to_owned())
                .or_insert_with(|| json!(transaction));
        }
        if let Some(release) = &self.release {
            doc.entry("release".to_owned())
                .or_insert_with(|| json!(release));
        }
        doc.entry("level".to_owned())
            .or_insert_with(|| json!(self.level));
    }
}

fn some_unless_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

fn login_name() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}
