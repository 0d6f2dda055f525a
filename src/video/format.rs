use tracing::{debug, warn};

use super::PixelFormat;

/// Pick the decoder output format: a hardware surface if offered anywhere in
/// the list, then YUV420P, then whatever `fallback` chooses.
pub fn negotiate_format<F>(candidates: &[PixelFormat], fallback: F) -> PixelFormat
where
    F: FnOnce(&[PixelFormat]) -> PixelFormat,
{
    if candidates.contains(&PixelFormat::DrmPrime) {
        debug!("get_format: using DRM_PRIME");
        return PixelFormat::DrmPrime;
    }
    if candidates.contains(&PixelFormat::Yuv420p) {
        debug!("get_format: using YUV420P");
        return PixelFormat::Yuv420p;
    }
    warn!("get_format: no supported pixel format in {:?}, using default", candidates);
    fallback(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(c: &[PixelFormat]) -> PixelFormat {
        c[0]
    }

    #[test]
    fn prime_wins_wherever_it_is_listed() {
        let got = negotiate_format(
            &[PixelFormat::Yuv420p, PixelFormat::Nv12, PixelFormat::DrmPrime],
            first,
        );
        assert_eq!(got, PixelFormat::DrmPrime);
    }

    #[test]
    fn software_then_default() {
        assert_eq!(
            negotiate_format(&[PixelFormat::Nv12, PixelFormat::Yuv420p], first),
            PixelFormat::Yuv420p
        );
        assert_eq!(
            negotiate_format(&[PixelFormat::Rgb24, PixelFormat::Nv12], first),
            PixelFormat::Rgb24
        );
    }
}
