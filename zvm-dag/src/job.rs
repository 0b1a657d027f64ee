use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::location::Location;

/// A fully parsed system map: the executable to run, its declared channels, and the replication
/// context under which this node is running the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// A human-readable name for the job, used in logs and debug artifacts.
    pub name: String,
    /// The number of replicas the dispatcher fanned this job out to, `<= 1` when not replicated.
    pub replicate: u32,
    /// The node ids of the replicas that are known to have started, as reported by the dispatcher.
    pub replicas: Vec<String>,
    /// Where the executable to run lives.
    pub exe: Location,
    /// The declared channels, in system-map order.
    pub channels: Vec<Channel>,
    /// `<salt>:<addr>` co-location probe supplied by a peer node, if any.
    pub colocated: Option<String>,
}

impl JobSpec {
    /// Whether this node is the one responsible for producing the response body.
    ///
    /// Only the master emits a response; the other replicas are expected to run the same job for
    /// redundancy/placement reasons but their output is discarded by the dispatcher.
    pub fn is_master(&self) -> bool {
        is_master(self.replicate, self.replicas.len())
    }
}

/// `is_master = replicate <= 1 || len(replicas) >= replicate - 1`.
pub fn is_master(replicate: u32, replicas_len: usize) -> bool {
    replicate <= 1 || replicas_len as u64 >= (replicate - 1) as u64
}

/// The binding between a channel and the local object named by the request URL, created when the
/// request's URL names a container or an object that one of the job's channels also refers to.
#[derive(Debug, Clone, Default)]
pub struct LocalObjectBinding {
    /// The account of the request's URL.
    pub account: String,
    /// The container of the request's URL.
    pub container: String,
    /// The object of the request's URL, if any.
    pub object: Option<String>,
    /// A disk handle opaque to this crate (provided by the out-of-scope `ObjectStore`), filled in
    /// once the local file has actually been opened.
    pub disk_handle: Option<String>,
    /// A container broker handle, present when the binding names a container rather than an
    /// object.
    pub broker: Option<String>,
    /// The channel index (into `JobSpec::channels`) bound to this local object, if resolution
    /// matched one.
    pub channel: Option<usize>,
    /// `true` iff `container` or `object` is non-empty, i.e. the URL names something at all.
    pub has_local_file: bool,
}

impl LocalObjectBinding {
    /// Build a binding for a request naming `account`/`container`[/`object`].
    pub fn new(account: impl Into<String>, container: impl Into<String>, object: Option<String>) -> LocalObjectBinding {
        let container = container.into();
        let has_local_file = !container.is_empty() || object.as_deref().is_some_and(|o| !o.is_empty());
        LocalObjectBinding {
            account: account.into(),
            container,
            object,
            disk_handle: None,
            broker: None,
            channel: None,
            has_local_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_replicated_node_is_master() {
        assert!(is_master(0, 0));
        assert!(is_master(1, 0));
    }

    #[test]
    fn replicated_node_is_master_once_enough_replicas_started() {
        assert!(!is_master(3, 0));
        assert!(!is_master(3, 1));
        assert!(is_master(3, 2));
        assert!(is_master(3, 3));
    }

    #[test]
    fn local_object_binding_tracks_presence() {
        let binding = LocalObjectBinding::new("a", "c", Some("o".into()));
        assert!(binding.has_local_file);
        let empty = LocalObjectBinding::new("a", "", None);
        assert!(!empty.has_local_file);
    }
}
