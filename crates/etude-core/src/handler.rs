// src/handler.rs
use crate::http::{Request, ResponseIntent, Status};
use std::path::{Component, Path, PathBuf};

/// Business logic behind the engine.
///
/// Called on a worker thread once a request is fully buffered. The returned
/// intent is turned into a response by the connection; file intents are
/// resolved and memory-mapped there, not here.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request<'_>) -> ResponseIntent;
}

impl<F> Handler for F
where
    F: Fn(&Request<'_>) -> ResponseIntent + Send + Sync + 'static,
{
    fn handle(&self, req: &Request<'_>) -> ResponseIntent {
        self(req)
    }
}

/// Serves files below `root`. `/` maps to `index.html`.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path under the root for a request target, or `None` if the target
    /// tries to climb out of it.
    pub fn resolve(&self, target: &str) -> Option<PathBuf> {
        let relative = target.trim_start_matches('/');
        let relative = if relative.is_empty() { "index.html" } else { relative };
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Handler for StaticFiles {
    fn handle(&self, req: &Request<'_>) -> ResponseIntent {
        match self.resolve(req.path) {
            Some(path) => ResponseIntent::file(path),
            None => ResponseIntent::error(Status::BadRequest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_maps_to_index() {
        let files = StaticFiles::new("/srv/www");
        assert_eq!(files.resolve("/"), Some(PathBuf::from("/srv/www/index.html")));
        assert_eq!(
            files.resolve("/css/site.css"),
            Some(PathBuf::from("/srv/www/css/site.css"))
        );
    }

    #[test]
    fn parent_segments_are_refused() {
        let files = StaticFiles::new("/srv/www");
        assert_eq!(files.resolve("/../etc/passwd"), None);
        assert_eq!(files.resolve("/a/../../b"), None);
    }
}
