use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Upper bound on a still frame handed to the uploader.
pub const MAX_IMAGE_SIZE_BYTES: usize = 20 * 1024 * 1024;

/// Camera hardware as seen from the core.
///
/// The shell owns the preview surface; the core only asks for permission
/// state, still frames and the release of the device when the scan screen
/// goes away. The shell enforces `CaptureConfig::timeout_ms` and answers a
/// capture that overruns it with [`CameraError::Timeout`].
#[derive(Clone)]
pub struct Camera<Ev> {
    context: CapabilityContext<CameraOperation, Ev>,
}

impl<Ev> Capability<Ev> for Camera<Ev> {
    type Operation = CameraOperation;
    type MappedSelf<MappedEv> = Camera<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + Copy + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Camera::new(self.context.map_event(f))
    }
}

impl<Ev> Camera<Ev>
where
    Ev: Send + 'static,
{
    pub fn new(context: CapabilityContext<CameraOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn permission_status<F>(&self, make_event: F)
    where
        F: FnOnce(PermissionStatus) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let status = match context
                .request_from_shell(CameraOperation::CheckPermission)
                .await
            {
                Ok(CameraOutput::Permission(status)) => status,
                other => {
                    warn!(reply = ?other, "unexpected permission reply, treating as denied");
                    PermissionStatus::Denied
                }
            };
            context.update_app(make_event(status));
        });
    }

    /// Asks the shell for one still frame. Frames are validated again on
    /// arrival since the shell hands them over as plain data.
    pub fn capture<F>(&self, config: CaptureConfig, make_event: F)
    where
        F: FnOnce(Result<CapturedImage, CameraError>) -> Ev + Send + 'static,
    {
        let config = config.validated();
        let context = self.context.clone();
        self.context.spawn(async move {
            let result = match context
                .request_from_shell(CameraOperation::Capture { config })
                .await
            {
                Ok(CameraOutput::Captured(image)) => image.validated(),
                Ok(other) => Err(CameraError::CaptureFailed {
                    reason: format!("unexpected reply {other:?}"),
                }),
                Err(e) => Err(e),
            };
            context.update_app(make_event(result));
        });
    }

    pub fn release(&self) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(CameraOperation::Release).await;
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraOperation {
    CheckPermission,
    Capture { config: CaptureConfig },
    Release,
}

impl Operation for CameraOperation {
    type Output = CameraResult;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraOutput {
    Permission(PermissionStatus),
    Captured(CapturedImage),
    Released,
}

pub type CameraResult = Result<CameraOutput, CameraError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// Recognizes a frame by its leading signature bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        const JPEG_SOI: &[u8] = &[0xFF, 0xD8, 0xFF];
        const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

        if data.starts_with(JPEG_SOI) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(PNG_SIGNATURE) {
            Some(ImageFormat::Png)
        } else {
            None
        }
    }
}

/// What the core asks of the shell for each scan attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub format: ImageFormat,
    pub quality: u8,
    /// Longest edge in pixels; the shell downsizes before handing over.
    pub max_dimension: u32,
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            quality: 85,
            max_dimension: 2048,
            timeout_ms: 10_000,
        }
    }
}

impl CaptureConfig {
    pub fn validated(mut self) -> Self {
        self.quality = self.quality.clamp(1, 100);
        self.max_dimension = self.max_dimension.clamp(256, 8192);
        self.timeout_ms = self.timeout_ms.clamp(1000, 60_000);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// A still frame ready for upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedImage {
    data: Vec<u8>,
    format: ImageFormat,
    width: u32,
    height: u32,
}

impl CapturedImage {
    pub fn new(
        data: Vec<u8>,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraError> {
        if data.is_empty() {
            return Err(CameraError::InvalidImage {
                reason: "image data is empty".to_string(),
            });
        }
        if data.len() > MAX_IMAGE_SIZE_BYTES {
            return Err(CameraError::ImageTooLarge {
                size: data.len(),
                max: MAX_IMAGE_SIZE_BYTES,
            });
        }
        match ImageFormat::sniff(&data) {
            Some(found) if found != format => Err(CameraError::InvalidImage {
                reason: format!("declared {format:?} but frame is {found:?}"),
            }),
            _ => Ok(Self {
                data,
                format,
                width,
                height,
            }),
        }
    }

    /// Re-runs the checks of [`CapturedImage::new`].
    pub fn validated(self) -> Result<Self, CameraError> {
        Self::new(self.data, self.format, self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// File name used for the multipart upload.
    pub fn file_name(&self) -> String {
        format!("scan.{}", self.format.extension())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn file_size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("camera unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },

    #[error("capture timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("image too large: {size} bytes exceeds maximum of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("camera released")]
    Released,
}

impl CameraError {
    pub fn is_permission_error(&self) -> bool {
        matches!(self, CameraError::PermissionDenied)
    }
}
