//! DXGI Desktop Duplication capture backend (Windows).
//!
//! Enumerates adapters until one accepts a D3D11 device, records its LUID
//! (the encoder must open pool slots on the same adapter), duplicates the
//! primary output and pulls frames with a short timeout. Each captured
//! frame is copied through a staging texture into a pool slot.
//!
//! On other platforms the type exists but construction fails at runtime;
//! use the test-pattern backend there.

use crate::capture::{CaptureBackend, CaptureBackendKind, CapturedFrame};
use crate::capture::pool::FramePool;
use crate::error::LtError;
use crate::negotiate::DisplaySetting;
use crate::types::PixelFormat;

/// How long one duplication poll may block before reporting "no frame".
const ACQUIRE_TIMEOUT_MS: u32 = 50;
/// Writer-side wait for a slot still held by the encoder.
const COPY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(5);

pub struct DxgiCapturer {
    width: u32,
    height: u32,
    refresh_hz: u32,
    luid: i64,

    #[cfg(windows)]
    device: windows::Win32::Graphics::Direct3D11::ID3D11Device,
    #[cfg(windows)]
    context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    #[cfg(windows)]
    output: windows::Win32::Graphics::Dxgi::IDXGIOutput,
    #[cfg(windows)]
    duplication: windows::Win32::Graphics::Dxgi::IDXGIOutputDuplication,
    #[cfg(windows)]
    staging: windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
}

#[cfg(windows)]
mod platform {
    use super::*;
    use windows::core::Interface;
    use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
    use windows::Win32::Graphics::Direct3D11::*;
    use windows::Win32::Graphics::Dxgi::Common::*;
    use windows::Win32::Graphics::Dxgi::*;

    impl DxgiCapturer {
        /// Initialize on the first adapter that yields a working device.
        pub fn new() -> Result<Self, LtError> {
            unsafe { Self::init() }
        }

        unsafe fn init() -> Result<Self, LtError> {
            let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
                .map_err(|e| LtError::Init(format!("CreateDXGIFactory1: {e}")))?;

            let mut index = 0u32;
            let (device, context, adapter, luid) = loop {
                let adapter = match unsafe { factory.EnumAdapters(index) } {
                    Ok(a) => a,
                    Err(_) => {
                        return Err(LtError::Init(format!(
                            "no usable adapter among {index} enumerated"
                        )));
                    }
                };
                index += 1;

                let desc = match unsafe { adapter.GetDesc() } {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                let luid = ((desc.AdapterLuid.HighPart as i64) << 32)
                    | (desc.AdapterLuid.LowPart as i64);

                let mut device = None;
                let mut context = None;
                let created = unsafe {
                    D3D11CreateDevice(
                        &adapter,
                        D3D_DRIVER_TYPE_UNKNOWN,
                        None,
                        D3D11_CREATE_DEVICE_FLAG(0),
                        None,
                        D3D11_SDK_VERSION,
                        Some(&mut device),
                        None,
                        Some(&mut context),
                    )
                };
                if created.is_err() {
                    continue;
                }
                match (device, context) {
                    (Some(d), Some(c)) => break (d, c, adapter, luid),
                    _ => continue,
                }
            };

            let output: IDXGIOutput = unsafe { adapter.EnumOutputs(0) }
                .map_err(|e| LtError::Init(format!("EnumOutputs(0): {e}")))?;
            let output1: IDXGIOutput1 = output
                .cast()
                .map_err(|e| LtError::Init(format!("cast IDXGIOutput1: {e}")))?;
            let duplication = unsafe { output1.DuplicateOutput(&device) }
                .map_err(|e| LtError::Init(format!("DuplicateOutput: {e}")))?;

            let dup_desc = unsafe { duplication.GetDesc() };
            let width = dup_desc.ModeDesc.Width;
            let height = dup_desc.ModeDesc.Height;
            let refresh_hz = if dup_desc.ModeDesc.RefreshRate.Denominator != 0 {
                dup_desc.ModeDesc.RefreshRate.Numerator / dup_desc.ModeDesc.RefreshRate.Denominator
            } else {
                60
            };

            let staging_desc = D3D11_TEXTURE2D_DESC {
                Width: width,
                Height: height,
                MipLevels: 1,
                ArraySize: 1,
                Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                SampleDesc: DXGI_SAMPLE_DESC {
                    Count: 1,
                    Quality: 0,
                },
                Usage: D3D11_USAGE_STAGING,
                BindFlags: 0,
                CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                MiscFlags: 0,
            };
            let mut staging = None;
            unsafe {
                device
                    .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                    .map_err(|e| LtError::Init(format!("CreateTexture2D: {e}")))?;
            }
            let staging =
                staging.ok_or_else(|| LtError::Init("staging texture is None".into()))?;

            tracing::info!("dxgi capturer on adapter luid={luid:#x}, {width}x{height}@{refresh_hz}");

            Ok(Self {
                width,
                height,
                refresh_hz,
                luid,
                device,
                context,
                output,
                duplication,
                staging,
            })
        }

        unsafe fn capture_inner(
            &mut self,
            pool: &FramePool,
        ) -> Result<Option<CapturedFrame>, LtError> {
            let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;
            match unsafe {
                self.duplication
                    .AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut frame_info, &mut resource)
            } {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                Err(e) => {
                    return Err(LtError::Init(format!("AcquireNextFrame: {e}")));
                }
            }

            // Unchanged desktop: the compositor can hand back a frame with
            // no accumulated updates.
            if frame_info.AccumulatedFrames == 0 && frame_info.LastPresentTime == 0 {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Ok(None);
            }

            let Some(resource) = resource else {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Ok(None);
            };
            let texture: ID3D11Texture2D = match resource.cast() {
                Ok(t) => t,
                Err(e) => {
                    let _ = unsafe { self.duplication.ReleaseFrame() };
                    return Err(LtError::Init(format!("cast ID3D11Texture2D: {e}")));
                }
            };

            unsafe { self.context.CopyResource(&self.staging, &texture) };
            // Release the source as early as possible.
            let _ = unsafe { self.duplication.ReleaseFrame() };

            let Some(slot) = pool.acquire() else {
                // Pool exhausted: drop this frame, never block capture.
                return Ok(None);
            };
            let name = pool
                .slot_name(slot)
                .map(str::to_owned)
                .unwrap_or_default();

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            unsafe {
                self.context
                    .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .map_err(|e| LtError::Init(format!("Map staging: {e}")))?;
            }
            let stride = mapped.RowPitch as usize;
            let row_len = self.width as usize * PixelFormat::Bgra8.bytes_per_pixel();
            let mut packed = Vec::with_capacity(row_len * self.height as usize);
            let src = unsafe {
                std::slice::from_raw_parts(mapped.pData as *const u8, stride * self.height as usize)
            };
            for y in 0..self.height as usize {
                packed.extend_from_slice(&src[y * stride..y * stride + row_len]);
            }
            unsafe { self.context.Unmap(&self.staging, 0) };

            if let Err(e) = pool.copy_into(slot, &packed, COPY_TIMEOUT) {
                // Consumer still owns the slot; drop the frame.
                let _ = pool.release(&name);
                tracing::debug!("slot '{name}' busy, dropping frame: {e}");
                return Ok(None);
            }

            Ok(Some(CapturedFrame {
                slot,
                name,
                width: self.width,
                height: self.height,
                format: PixelFormat::Bgra8,
            }))
        }

        fn vblank(&self) {
            let _ = unsafe { self.output.WaitForVBlank() };
        }
    }
}

#[cfg(not(windows))]
impl DxgiCapturer {
    /// DXGI duplication only exists on Windows.
    pub fn new() -> Result<Self, LtError> {
        Err(LtError::Init(
            "DXGI desktop duplication is only available on Windows".into(),
        ))
    }

    fn vblank(&self) {
        std::thread::sleep(std::time::Duration::from_millis(
            1_000 / self.refresh_hz.max(1) as u64,
        ));
    }

    unsafe fn capture_inner(
        &mut self,
        _pool: &FramePool,
    ) -> Result<Option<CapturedFrame>, LtError> {
        Err(LtError::Init("not supported on this platform".into()))
    }
}

impl CaptureBackend for DxgiCapturer {
    fn kind(&self) -> CaptureBackendKind {
        CaptureBackendKind::Dxgi
    }

    fn luid(&self) -> i64 {
        self.luid
    }

    fn display(&self) -> DisplaySetting {
        DisplaySetting::new(self.width, self.height, self.refresh_hz)
    }

    fn wait_for_vblank(&mut self) {
        self.vblank();
    }

    fn capture_one(&mut self, pool: &FramePool) -> Result<Option<CapturedFrame>, LtError> {
        unsafe { self.capture_inner(pool) }
    }
}
