use crate::{codec::SampleInfo, format::MediaFormat};

/// The container-writing primitive underneath the track muxer.
///
/// Every track is added before `start`, which commits the container header.
/// `stop` writes the trailer; `release` closes the output. A writer that is
/// released without `stop` leaves an unfinished file behind, which `discard`
/// removes.
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &MediaFormat) -> anyhow::Result<usize>;

    fn start(&mut self) -> anyhow::Result<()>;

    fn write_sample_data(
        &mut self,
        track_index: usize,
        data: &[u8],
        info: &SampleInfo,
    ) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    fn release(&mut self);

    fn discard(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
