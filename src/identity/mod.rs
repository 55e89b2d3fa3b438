//! Identity layer — pending registrations, one-time code verification and
//! bearer credentials.

pub mod gate;
pub mod model;
pub mod notify;
pub mod provisioner;
pub mod secrets;

pub use gate::VerificationGate;
pub use model::{Credential, RegistrationRequest, RegistrationSession, Role, SessionState, UserRecord};
pub use notify::{CodeNotifier, LogNotifier, WebhookNotifier};
pub use provisioner::IdentityProvisioner;
