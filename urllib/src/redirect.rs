//! Redirect policy: which responses are followed, where they lead, and what
//! the next hop's request looks like.

use http::header::{
    HeaderName, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION,
    TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::RequestError;
use crate::options::{PreparedBody, PreparedRequest};

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Counts followed hops against the limit of one logical request.
#[derive(Debug)]
pub(crate) struct RedirectPolicy {
    max: u32,
    followed: u32,
}

impl RedirectPolicy {
    pub(crate) fn new(max: u32) -> Self {
        Self { max, followed: 0 }
    }

    /// Resolves the `Location` of a redirect response against the current
    /// url and counts the hop. The hop after `max` followed ones fails.
    pub(crate) fn next_location(
        &mut self,
        current: &Url,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<Url, RequestError> {
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let Some(location) = location else {
            return Err(RequestError::FollowRedirect {
                status,
                headers: headers.clone(),
            });
        };

        if self.followed >= self.max {
            return Err(RequestError::MaxRedirects {
                max: self.max,
                status,
                headers: headers.clone(),
                location: location.to_string(),
            });
        }

        let next = current
            .join(location)
            .map_err(|_| RequestError::FollowRedirect {
                status,
                headers: headers.clone(),
            })?;
        self.followed += 1;
        Ok(next)
    }
}

/// Builds the request for the next hop from the one that got redirected.
pub(crate) fn next_hop(
    previous: &PreparedRequest,
    status: StatusCode,
    response_headers: &HeaderMap,
    mut url: Url,
) -> Result<PreparedRequest, RequestError> {
    url.set_fragment(None);
    let mut headers = previous.headers.clone();

    let see_other = status == StatusCode::SEE_OTHER && previous.method != Method::HEAD;
    let (method, body) = if see_other {
        for name in [CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING] {
            headers.remove(name);
        }
        (Method::GET, PreparedBody::Empty)
    } else {
        let body = match &previous.body {
            PreparedBody::Empty => PreparedBody::Empty,
            PreparedBody::Full(bytes) => PreparedBody::Full(bytes.clone()),
            PreparedBody::Stream(_) => {
                return Err(RequestError::UnreplayableBody {
                    status,
                    headers: response_headers.clone(),
                })
            }
        };
        (previous.method.clone(), body)
    };

    headers.remove(HOST);
    if !same_origin(&previous.url, &url) {
        remove_sensitive_headers(&mut headers);
    }

    Ok(PreparedRequest {
        method,
        url,
        headers,
        body,
    })
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

fn remove_sensitive_headers(headers: &mut HeaderMap) {
    for name in [AUTHORIZATION, COOKIE, HeaderName::from_static("proxy-authorization")] {
        headers.remove(name);
    }
}
