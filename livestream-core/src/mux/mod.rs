//! Container multiplexers and the bitstream helpers they share.

pub mod adts;
pub mod mp4;
pub mod nal;
pub mod ts;

use crate::models::config::{ContainerFormat, SessionSettings};
use crate::models::media::MimeType;
use crate::traits::muxer::{Muxer, MuxerOutput};

/// Build the muxer selected by `settings`, writing into `output`.
pub fn create_muxer(settings: &SessionSettings, output: MuxerOutput) -> Box<dyn Muxer> {
    match settings.container {
        ContainerFormat::Ts => Box::new(ts::TsMuxer::new(settings.table_refresh, output)),
        ContainerFormat::Mp4 => Box::new(mp4::Mp4Muxer::new(output)),
    }
}

/// Whether `container` can carry `mime_type`.
pub fn supports(container: ContainerFormat, mime_type: MimeType) -> bool {
    match container {
        ContainerFormat::Ts => true,
        ContainerFormat::Mp4 => mp4::supports(mime_type),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    #[test]
    fn factory_follows_settings() {
        let output: MuxerOutput = Arc::new(|_: Bytes| {});
        let ts = create_muxer(&SessionSettings::default(), Arc::clone(&output));
        assert_eq!(ts.container(), ContainerFormat::Ts);

        let settings = SessionSettings {
            container: ContainerFormat::Mp4,
            ..SessionSettings::default()
        };
        assert_eq!(create_muxer(&settings, output).container(), ContainerFormat::Mp4);
    }

    #[test]
    fn mp4_carries_avc_and_aac_only() {
        assert!(supports(ContainerFormat::Ts, MimeType::Opus));
        assert!(supports(ContainerFormat::Mp4, MimeType::Aac));
        assert!(!supports(ContainerFormat::Mp4, MimeType::Hevc));
        assert!(!supports(ContainerFormat::Mp4, MimeType::Opus));
    }
}
