// Remote side of a dispatch: the chunked media upload and the announcement
// that references the uploaded media.

pub mod announcer;
pub mod clock;
pub mod media_client;
pub mod oauth;
pub mod session;

pub use announcer::{Announcer, PublicReference};
pub use clock::{Clock, ManualClock, TokioClock};
pub use media_client::{MediaUploadClient, UploadOptions, UploadedMedia};
pub use oauth::{OAuthCredentials, OAuthSigner};
pub use session::{SessionState, UploadSession};
