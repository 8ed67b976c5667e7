//! The wire envelope and its codec.
//!
//! An envelope carries either a plaintext payload or a ciphertext (plus a tag
//! for AES). In memory that choice is the [`Body`] enum, so the mode can never
//! disagree with what is populated. On the wire every field is optional and
//! [`Envelope::decode`] enforces the invariant on untrusted input.

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;

/// Encryption applied to an envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    Plaintext,
    Rsa,
    Aes,
}

/// Error codes reported to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    MalformedEnvelope,
    EncryptionError,
    DecryptionError,
    AuthenticationFailed,
    ProtocolSequence,
    UnknownService,
    Internal,
}

/// Structured error attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub details: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }
}

impl From<&ChatError> for ErrorInfo {
    fn from(error: &ChatError) -> Self {
        Self::new(error.error_code(), error.to_string())
    }
}

/// Sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub username: String,
}

impl ClientInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Envelope contents, one variant per encryption mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Plaintext(Vec<u8>),
    Rsa { ciphertext: Vec<u8> },
    Aes { ciphertext: Vec<u8>, tag: Vec<u8> },
}

impl Body {
    /// The encryption mode this body travels under.
    pub fn mode(&self) -> EncryptionMode {
        match self {
            Self::Plaintext(_) => EncryptionMode::Plaintext,
            Self::Rsa { .. } => EncryptionMode::Rsa,
            Self::Aes { .. } => EncryptionMode::Aes,
        }
    }
}

/// The only unit ever placed on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Key epoch that produced, or is expected to open, this envelope.
    pub encryption_timestamp: f64,
    pub message_name: String,
    pub body: Body,
    pub error: Option<ErrorInfo>,
    pub client_info: Option<ClientInfo>,
}

/// Serialized form. Presence of each field is validated on decode.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    encryption_mode: EncryptionMode,
    encryption_timestamp: f64,
    message_name: String,
    payload: Option<Vec<u8>>,
    ciphertext: Option<Vec<u8>>,
    tag: Option<Vec<u8>>,
    error: Option<ErrorInfo>,
    client_info: Option<ClientInfo>,
}

impl Envelope {
    fn with_body(timestamp: f64, message_name: impl Into<String>, body: Body) -> Self {
        Self {
            encryption_timestamp: timestamp,
            message_name: message_name.into(),
            body,
            error: None,
            client_info: None,
        }
    }

    /// A plaintext envelope.
    pub fn plaintext(timestamp: f64, message_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::with_body(timestamp, message_name, Body::Plaintext(payload))
    }

    /// An RSA envelope.
    pub fn rsa(timestamp: f64, message_name: impl Into<String>, ciphertext: Vec<u8>) -> Self {
        Self::with_body(timestamp, message_name, Body::Rsa { ciphertext })
    }

    /// An AES envelope.
    pub fn aes(
        timestamp: f64,
        message_name: impl Into<String>,
        ciphertext: Vec<u8>,
        tag: Vec<u8>,
    ) -> Self {
        Self::with_body(timestamp, message_name, Body::Aes { ciphertext, tag })
    }

    /// An error reply with an empty plaintext body.
    pub fn error_reply(timestamp: f64, message_name: impl Into<String>, error: ErrorInfo) -> Self {
        let mut envelope = Self::plaintext(timestamp, message_name, Vec::new());
        envelope.error = Some(error);
        envelope
    }

    /// Attaches sender identity.
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = Some(client_info);
        self
    }

    pub fn mode(&self) -> EncryptionMode {
        self.body.mode()
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ChatError> {
        let (payload, ciphertext, tag) = match &self.body {
            Body::Plaintext(payload) => (Some(payload.clone()), None, None),
            Body::Rsa { ciphertext } => (None, Some(ciphertext.clone()), None),
            Body::Aes { ciphertext, tag } => (None, Some(ciphertext.clone()), Some(tag.clone())),
        };
        let wire = WireEnvelope {
            encryption_mode: self.mode(),
            encryption_timestamp: self.encryption_timestamp,
            message_name: self.message_name.clone(),
            payload,
            ciphertext,
            tag,
            error: self.error.clone(),
            client_info: self.client_info.clone(),
        };
        bincode::serialize(&wire).map_err(|e| ChatError::SerializationFailed(e.to_string()))
    }

    /// Parses untrusted bytes into an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChatError> {
        let wire: WireEnvelope = bincode::deserialize(bytes)
            .map_err(|e| ChatError::MalformedEnvelope(e.to_string()))?;

        if wire.message_name.is_empty() {
            return Err(ChatError::MalformedEnvelope(
                "message_name is empty".to_string(),
            ));
        }
        if !wire.encryption_timestamp.is_finite() {
            return Err(ChatError::MalformedEnvelope(
                "encryption_timestamp is not finite".to_string(),
            ));
        }

        let body = match (wire.encryption_mode, wire.payload, wire.ciphertext, wire.tag) {
            (EncryptionMode::Plaintext, Some(payload), None, None) => Body::Plaintext(payload),
            (EncryptionMode::Rsa, None, Some(ciphertext), None) => Body::Rsa { ciphertext },
            (EncryptionMode::Aes, None, Some(ciphertext), Some(tag)) => {
                Body::Aes { ciphertext, tag }
            }
            (mode, payload, ciphertext, tag) => {
                return Err(ChatError::MalformedEnvelope(format!(
                    "{:?} envelope with payload={} ciphertext={} tag={}",
                    mode,
                    payload.is_some(),
                    ciphertext.is_some(),
                    tag.is_some()
                )));
            }
        };

        Ok(Self {
            encryption_timestamp: wire.encryption_timestamp,
            message_name: wire.message_name,
            body,
            error: wire.error,
            client_info: wire.client_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bytes() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..256)
    }

    impl Arbitrary for Body {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            prop_oneof![
                bytes().prop_map(Body::Plaintext),
                bytes().prop_map(|ciphertext| Body::Rsa { ciphertext }),
                (bytes(), bytes()).prop_map(|(ciphertext, tag)| Body::Aes { ciphertext, tag }),
            ]
            .boxed()
        }
    }

    impl Arbitrary for ErrorInfo {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            let code = prop_oneof![
                Just(ErrorCode::MalformedEnvelope),
                Just(ErrorCode::EncryptionError),
                Just(ErrorCode::DecryptionError),
                Just(ErrorCode::AuthenticationFailed),
                Just(ErrorCode::ProtocolSequence),
                Just(ErrorCode::UnknownService),
                Just(ErrorCode::Internal),
            ];
            (code, "\\PC{0,64}")
                .prop_map(|(code, details)| ErrorInfo::new(code, details))
                .boxed()
        }
    }

    impl Arbitrary for Envelope {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            (
                -1.0e12f64..1.0e12f64,
                "\\PC{1,32}",
                any::<Body>(),
                proptest::option::of(any::<ErrorInfo>()),
                proptest::option::of("\\PC{0,16}".prop_map(ClientInfo::new)),
            )
                .prop_map(|(timestamp, message_name, body, error, client_info)| Envelope {
                    encryption_timestamp: timestamp,
                    message_name,
                    body,
                    error,
                    client_info,
                })
                .boxed()
        }
    }

    proptest! {
        #[test]
        fn test_envelope_round_trip(envelope in any::<Envelope>()) {
            let wire = envelope.encode().expect("should encode");
            let decoded = Envelope::decode(&wire).expect("should decode");
            prop_assert_eq!(decoded, envelope);
        }
    }

    fn raw(
        mode: EncryptionMode,
        payload: Option<Vec<u8>>,
        ciphertext: Option<Vec<u8>>,
        tag: Option<Vec<u8>>,
    ) -> Vec<u8> {
        bincode::serialize(&WireEnvelope {
            encryption_mode: mode,
            encryption_timestamp: 1.5,
            message_name: "ChatRoomMessage".to_string(),
            payload,
            ciphertext,
            tag,
            error: None,
            client_info: None,
        })
        .unwrap()
    }

    #[test]
    fn test_roundtrip_each_mode() {
        let envelopes = [
            Envelope::plaintext(1700000000.25, "Authenticator", vec![1, 2, 3])
                .with_client_info(ClientInfo::new("alice")),
            Envelope::rsa(1700000000.25, "Authenticator", vec![9; 128]),
            Envelope::aes(1700000000.25, "ChatRoomMessage", vec![7; 40], vec![0xAA; 16]),
            Envelope::error_reply(
                0.0,
                "ChatRoomMessage",
                ErrorInfo::new(ErrorCode::AuthenticationFailed, "bad tag"),
            ),
        ];

        for envelope in envelopes {
            let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_mode_follows_body() {
        assert_eq!(
            Envelope::plaintext(0.0, "x", vec![]).mode(),
            EncryptionMode::Plaintext
        );
        assert_eq!(Envelope::rsa(0.0, "x", vec![]).mode(), EncryptionMode::Rsa);
        assert_eq!(
            Envelope::aes(0.0, "x", vec![], vec![]).mode(),
            EncryptionMode::Aes
        );
    }

    #[test]
    fn test_plaintext_with_ciphertext_rejected() {
        let bytes = raw(EncryptionMode::Plaintext, Some(vec![1]), Some(vec![2]), None);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_aes_without_tag_rejected() {
        let bytes = raw(EncryptionMode::Aes, None, Some(vec![2]), None);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_rsa_with_tag_rejected() {
        let bytes = raw(EncryptionMode::Rsa, None, Some(vec![2]), Some(vec![3]));
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_missing_body_rejected() {
        let bytes = raw(EncryptionMode::Plaintext, None, None, None);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            Envelope::decode(&[0xFF, 0x01]),
            Err(ChatError::MalformedEnvelope(_))
        ));
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn test_empty_message_name_rejected() {
        let bytes = Envelope::plaintext(0.0, "", vec![1]).encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ChatError::MalformedEnvelope(_))
        ));
    }
}
