//! Platform seams. The shell answers every request the core makes: camera
//! frames, timers, navigation, HTTP and key-value storage all arrive as
//! effects, so the core runs in tests without a camera, a network or a
//! view router.

mod camera;
mod http;
mod kv;
mod navigation;
mod timer;

pub use self::camera::{
    Camera, CameraError, CameraOperation, CameraOutput, CameraResult, CaptureConfig,
    CapturedImage, ImageFormat, PermissionStatus, MAX_IMAGE_SIZE_BYTES,
};
pub use self::http::{
    HttpBody, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    MultipartForm, MultipartPart, ShellHttpTransport, ValidatedUrl, DEFAULT_TIMEOUT_MS,
};
#[cfg(feature = "native-http")]
pub use self::http::ReqwestTransport;
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, ShellKvStore, StorageErrorCode,
    TypedKvStore,
};
pub use self::navigation::{NavigationOperation, Navigator};
pub use self::timer::{Timer, TimerOperation, TimerOutput};

pub use crux_core::compose::Compose;
pub use crux_core::render::Render;
pub use crux_http::Http;
pub use crux_kv::KeyValue;

use crate::event::ScanEvent;
use crate::scan::ScanCoordinator;

pub type AppHttp = Http<ScanEvent>;
pub type AppKv = KeyValue<ScanEvent>;
pub type AppRender = Render<ScanEvent>;
pub type AppCamera = Camera<ScanEvent>;
pub type AppTimer = Timer<ScanEvent>;
pub type AppNavigator = Navigator<ScanEvent>;

#[derive(crux_core::macros::Effect)]
#[effect(app = "ScanCoordinator")]
pub struct Capabilities {
    pub camera: Camera<ScanEvent>,
    pub http: Http<ScanEvent>,
    pub kv: KeyValue<ScanEvent>,
    pub navigator: Navigator<ScanEvent>,
    pub render: Render<ScanEvent>,
    pub timer: Timer<ScanEvent>,

    /// Runs the authenticated client, which chains HTTP and storage requests.
    #[effect(skip)]
    pub compose: Compose<ScanEvent>,
}
