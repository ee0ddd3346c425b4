use crate::{token, Error};
use tonic::metadata::MetadataMap;

/// Extracts the bearer token from request metadata. A missing token is an
/// authentication failure; a present-but-malformed `authorization` header
/// (wrong scheme, repeated, non-ASCII) is rejected as an invalid argument
/// before authentication is attempted.
pub fn bearer(metadata: &MetadataMap) -> Result<&str, Error> {
    let mut headers = metadata.get_all("authorization").iter();
    let header = headers.next().ok_or_else(|| {
        Error::Unauthenticated(token::Error::Malformed("no bearer token presented".to_string()))
    })?;
    if headers.next().is_some() {
        return Err(Error::InvalidArgument(
            "multiple authorization headers present",
        ));
    }

    let value = header
        .to_str()
        .map_err(|_| Error::InvalidArgument("authorization header is not valid ASCII"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(Error::InvalidArgument(
            "authorization header is not a bearer token",
        ))
}
