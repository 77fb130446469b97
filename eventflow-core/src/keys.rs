use eventflow_shared::stream::StreamPartition;

/// Builds store keys for one consumer group reading one stream:
///
/// ```text
/// {group}/{stream}/ownership/{partition}
/// {group}/{stream}/checkpoint/{partition}
/// {group}/{stream}/instances/{instance}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Keyspace {
    root: String,
}

impl Keyspace {
    pub(crate) fn new(consumer_group: &str, stream_id: &str) -> Self {
        Self {
            root: format!("{consumer_group}/{stream_id}"),
        }
    }

    pub(crate) fn ownership_prefix(&self) -> String {
        format!("{}/ownership/", self.root)
    }

    pub(crate) fn ownership(&self, partition: &StreamPartition) -> String {
        format!("{}{}", self.ownership_prefix(), partition.partition_id)
    }

    pub(crate) fn checkpoint(&self, partition: &StreamPartition) -> String {
        format!("{}/checkpoint/{}", self.root, partition.partition_id)
    }

    pub(crate) fn presence_prefix(&self) -> String {
        format!("{}/instances/", self.root)
    }

    pub(crate) fn presence(&self, instance_id: &str) -> String {
        format!("{}{}", self.presence_prefix(), instance_id)
    }
}
