//! OAuth request signing.
//!
//! Computing the actual signature is a pure function mapping request
//! metadata to an `Authorization` header value, supplied by the embedder.
//! The engine only needs something it can call while building a request
//! (`connection::build_request`); [`OAuthSigner`] is that seam.

/// Signs a request, producing the value of its `Authorization` header.
///
/// Implementations are expected to be pure with respect to their inputs:
/// the engine may call `sign` once per request and caches nothing.
pub trait OAuthSigner: Send + Sync {
    /// Computes the header value for `method {path}` with the given body.
    fn sign(&self, method: &str, url: &str, body: &[u8]) -> String;
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::OAuthSigner;

    /// A fixed-output signer used only by this crate's own tests, standing
    /// in for a real HMAC-based implementation supplied by the embedder.
    #[derive(Debug)]
    pub struct FixedOAuthSigner(pub &'static str);

    impl OAuthSigner for FixedOAuthSigner {
        fn sign(&self, _method: &str, _url: &str, _body: &[u8]) -> String {
            self.0.to_string()
        }
    }
}
