use tracing::info;

use crate::capture::SourceId;

/// Device indices `0..limit` whose `/dev/video<N>` node exists.
///
/// Platforms without device nodes report nothing; sources must be listed
/// explicitly there.
pub fn probe_video_devices(limit: u32) -> Vec<SourceId> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }

    let sources: Vec<SourceId> = (0..limit)
        .filter(|i| std::path::Path::new(&format!("/dev/video{}", i)).exists())
        .map(SourceId::Index)
        .collect();

    info!("Detected cameras: {:?}", sources);
    sources
}

/// Like [`probe_video_devices`], but keeps only nodes that can capture.
#[cfg(feature = "v4l2")]
pub fn probe_capture_devices(limit: u32) -> Vec<SourceId> {
    use v4l::{capability::Flags, Device};

    info!("Auto-detecting capture devices...");

    probe_video_devices(limit)
        .into_iter()
        .filter(|source| {
            let SourceId::Index(i) = source else {
                return false;
            };
            let Ok(dev) = Device::new(*i as usize) else {
                return false;
            };
            match dev.query_caps() {
                Ok(caps) if caps.capabilities.contains(Flags::VIDEO_CAPTURE) => {
                    info!("Found capture device: /dev/video{} - {}", i, caps.card);
                    true
                }
                _ => false,
            }
        })
        .collect()
}
