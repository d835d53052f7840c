//! Process-wide registry of media sources.
//!
//! Sources are reachable by numeric stream id (live sources) and by name
//! (decimal ids and file paths). The map itself is plain data — the
//! owning [`Server`](crate::server::Server) guards it with one mutex
//! held only across find/save/erase critical sections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::source::Source;

#[derive(Default)]
pub(crate) struct SourceMap {
    by_name: HashMap<String, Arc<Source>>,
    by_id: Vec<Option<Arc<Source>>>,
}

impl SourceMap {
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Source>> {
        let source = self.by_name.get(name).cloned();
        tracing::trace!(name, found = source.is_some(), "source map lookup by name");
        source
    }

    pub fn find_by_id(&self, id: u32) -> Option<Arc<Source>> {
        let source = self.by_id.get(id as usize).cloned().flatten();
        tracing::trace!(id, found = source.is_some(), "source map lookup by id");
        source
    }

    pub fn save_named(&mut self, name: &str, source: Arc<Source>) {
        tracing::debug!(name, "saving source");
        self.by_name.insert(name.to_string(), source);
    }

    /// Register a source under its id and under a name (the decimal id
    /// when no explicit name is given).
    pub fn save(&mut self, id: u32, source: Arc<Source>, name: Option<&str>) {
        let index = id as usize;
        if index >= self.by_id.len() {
            self.by_id.resize(index + 1, None);
        }
        self.by_id[index] = Some(source.clone());
        match name {
            Some(name) => self.save_named(name, source),
            None => self.save_named(&id.to_string(), source),
        }
        tracing::debug!(id, "saving source");
    }

    pub fn erase(&mut self, name: &str) {
        match self.by_name.remove(name) {
            Some(source) => {
                if let Some(id) = source.stream_id()
                    && let Some(slot) = self.by_id.get_mut(id as usize)
                {
                    *slot = None;
                }
                tracing::debug!(name, "erased source");
            }
            None => tracing::warn!(name, "attempting to erase non-existing source"),
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.by_name.values()
    }
}
