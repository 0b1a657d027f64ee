use std::path::Path;
use std::time::Duration;

use zvm_dag::AccessFlags;

/// Per-channel I/O quota, copied verbatim into the `Channel=` manifest line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    /// Maximum number of read operations.
    pub reads: u64,
    /// Maximum number of bytes read.
    pub rbytes: u64,
    /// Maximum number of write operations.
    pub writes: u64,
    /// Maximum number of bytes written.
    pub wbytes: u64,
}

/// The manifest's notion of a channel's direction/semantics, distinct from `AccessFlags` (the
/// flags a channel was declared with): the manifest line only ever names one numeric type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelType(pub u32);

impl ChannelType {
    /// Derive the manifest type code from a channel's access flags: the raw bitfield value, since
    /// the sandbox interprets the same bit layout this crate uses for `AccessFlags`.
    pub fn from_access(access: AccessFlags) -> ChannelType {
        ChannelType(access.bits())
    }
}

/// One `Channel=` line's worth of data.
#[derive(Debug, Clone)]
pub struct ManifestChannel {
    /// The host path the sandbox should open for this channel (or a device name for non-file
    /// channels, e.g. `/dev/null`).
    pub source: String,
    /// The device name as seen from inside the sandbox.
    pub device: String,
    /// The channel's type code.
    pub etype: ChannelType,
    /// The ETag-like tag reported back for this channel, empty when not applicable.
    pub tag: String,
    /// This channel's I/O quota.
    pub limits: ManifestLimits,
}

/// Render a standalone-mode manifest: `Version`, `Program`, `Timeout`, `Memory`, then one
/// `Channel=` line per channel.
pub fn render_manifest(
    version: &str,
    program: &Path,
    timeout: Duration,
    memory: u64,
    channels: &[ManifestChannel],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Version = {version}\n"));
    out.push_str(&format!("Program = {}\n", program.display()));
    out.push_str(&format!("Timeout = {}\n", timeout.as_secs()));
    out.push_str(&format!("Memory = {memory}\n"));
    for channel in channels {
        out.push_str(&format!(
            "Channel = {},{},{},{},{},{},{},{}\n",
            channel.source,
            channel.device,
            channel.etype.0,
            channel.tag,
            channel.limits.reads,
            channel.limits.rbytes,
            channel.limits.writes,
            channel.limits.wbytes,
        ));
    }
    out
}

/// Render the NVRAM side-file that accompanies a manifest: one `[channel_name]` section per
/// channel, with `Channel = <device>` so the booted program can recover its own device mapping.
pub fn render_nvram(channels: &[ManifestChannel]) -> String {
    let mut out = String::new();
    for channel in channels {
        out.push_str(&format!("[mapping]\nChannel = {}\n", channel.device));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_channel(device: &str) -> ManifestChannel {
        ManifestChannel {
            source: format!("/tmp/{device}"),
            device: device.to_string(),
            etype: ChannelType::from_access(AccessFlags::READABLE),
            tag: String::new(),
            limits: ManifestLimits {
                reads: 1,
                rbytes: 1024,
                writes: 0,
                wbytes: 0,
            },
        }
    }

    #[test]
    fn renders_the_expected_line_order() {
        let manifest = render_manifest(
            "20130611",
            &PathBuf::from("/tmp/boot"),
            Duration::from_secs(10),
            4096,
            &[sample_channel("input")],
        );
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines[0], "Version = 20130611");
        assert_eq!(lines[1], "Program = /tmp/boot");
        assert_eq!(lines[2], "Timeout = 10");
        assert_eq!(lines[3], "Memory = 4096");
        assert!(lines[4].starts_with("Channel = /tmp/input,input,"));
    }

    #[test]
    fn nvram_has_one_section_per_channel() {
        let nvram = render_nvram(&[sample_channel("input"), sample_channel("output")]);
        assert_eq!(nvram.matches("[mapping]").count(), 2);
        assert!(nvram.contains("Channel = input\n"));
        assert!(nvram.contains("Channel = output\n"));
    }
}
