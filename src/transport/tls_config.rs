//! TLS configuration for device channels.
//!
//! Peers authenticate with long-lived self-signed certificates, so handshake
//! verification is a no-op and trust decisions happen at the application
//! layer: the channel pins the peer's leaf certificate byte-for-byte once a
//! device is paired. The verify callback still requests the peer certificate
//! (mode PEER) so both roles present their leaf.
//!
//! The cipher list and TLS 1.0 floor match the KDE Connect daemon; older
//! Android peers still negotiate `ECDHE-RSA-AES128-SHA` over TLS 1.0 and
//! `@SECLEVEL=1` is required to keep that acceptable to OpenSSL.

use crate::certificate::CertificateInfo;
use crate::Result;
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;

const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// TLS acceptor for the server role (the side that initiated the TCP
/// connection).
pub fn acceptor(local: &CertificateInfo) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // Request the client certificate but accept any; pinning happens after
    // the handshake against the remembered leaf.
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);

    let cert = X509::from_der(&local.certificate)?;
    let pkey = PKey::private_key_from_der(&local.private_key)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

/// TLS connector for the client role (the side that accepted the TCP
/// connection takes this role; exercised here by test peers).
pub fn connector(local: &CertificateInfo) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);

    let cert = X509::from_der(&local.certificate)?;
    let pkey = PKey::private_key_from_der(&local.private_key)?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_acceptor_and_connector() {
        let cert = CertificateInfo::generate("tls_config_device").unwrap();
        acceptor(&cert).unwrap();
        connector(&cert).unwrap();
    }
}
