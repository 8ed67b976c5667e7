//! Chat protocol types and operations.
//!
//! - **Envelope** codec with the mode/body invariant enforced on decode
//! - **Handshake** state machines for both ends of a connection

mod envelope;
mod handshake;

pub use envelope::{Body, ClientInfo, EncryptionMode, Envelope, ErrorCode, ErrorInfo};
pub use handshake::{
    AuthenticationStep, ClientHandshake, HandshakeAction, HandshakeMessage, HandshakeState,
    RsaPublicKeyParts, SecureChannel, ServerHandshake, AUTHENTICATOR,
};
