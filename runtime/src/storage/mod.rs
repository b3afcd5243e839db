//! Implementations of the [crate::Storage] trait.

pub mod memory;
pub mod tokio;

/// Validates that a partition name contains only allowed characters.
///
/// Allowed characters are ASCII alphanumerics, dashes (`-`), and underscores (`_`).
pub(crate) fn validate_partition_name(partition: &str) -> Result<(), crate::Error> {
    if partition.is_empty()
        || !partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::Error::PartitionNameInvalid(partition.into()));
    }
    Ok(())
}

/// Encode a blob name for use in paths and error messages.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
