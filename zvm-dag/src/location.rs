use serde::{Deserialize, Serialize};

/// Where a channel's bytes (or an executable) live before the job starts.
///
/// This mirrors the `exec.path` / channel `path` entries of the system map: the config-map parser
/// (external to this crate) is responsible for producing one of these from the raw JSON, this type
/// just gives it a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// `swift://account/container[/object]`: a path into the object store.
    SwiftPath {
        /// The account owning the container/object.
        account: String,
        /// The container name.
        container: String,
        /// The object name, absent when the location names a whole container (e.g. a listing).
        object: Option<String>,
    },
    /// A path inside the job's own system image, e.g. `image:/bin/daemon`.
    ImagePath {
        /// The name of the system image device the path is relative to.
        image: String,
        /// The path inside the image.
        inner_path: String,
    },
    /// A path already local to this node, used for `boot` executables extracted from an image.
    LocalPath(std::path::PathBuf),
}

impl Location {
    /// Whether this location names the same object (not just the same container) as
    /// `account`/`container`/`object`, i.e. the request's own local object URL.
    pub fn is_local_object(&self, account: &str, container: &str, object: Option<&str>) -> bool {
        match self {
            Location::SwiftPath {
                account: a,
                container: c,
                object: o,
            } => a == account && c == container && o.as_deref() == object,
            _ => false,
        }
    }

    /// Whether this location names a container (no object component) matching `account`/`container`.
    pub fn is_local_container(&self, account: &str, container: &str) -> bool {
        matches!(self, Location::SwiftPath { account: a, container: c, object: None } if a == account && c == container)
    }
}
