use anyhow::{Context, Result};
use zstd_safe::{CCtx, CParameter, DCtx, ErrorCode, ResetDirective};

// Persistent codec contexts. Both are created once per worker process; every
// operation resets only the session state, so the internal workspaces
// allocated during the preallocation self-test are reused for the lifetime
// of the process.
pub(crate) struct Codec {
    cctx: CCtx<'static>,
    dctx: DCtx<'static>,
}

impl Codec {
    pub(crate) fn new(level: i32) -> Result<Codec> {
        let mut cctx = CCtx::try_create().context("create compression context")?;
        cctx.set_parameter(CParameter::CompressionLevel(level))
            .map_err(codec_error)
            .context("set compression level")?;
        let dctx = DCtx::try_create().context("create decompression context")?;
        Ok(Codec { cctx, dctx })
    }

    pub(crate) fn compress(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.cctx
            .reset(ResetDirective::SessionOnly)
            .map_err(codec_error)?;
        self.cctx.compress2(out, input).map_err(codec_error)
    }

    pub(crate) fn decompress(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.dctx
            .reset(ResetDirective::SessionOnly)
            .map_err(codec_error)?;
        self.dctx.decompress(out, input).map_err(codec_error)
    }
}

fn codec_error(code: ErrorCode) -> anyhow::Error {
    anyhow::anyhow!("codec error: {}", zstd_safe::get_error_name(code))
}
