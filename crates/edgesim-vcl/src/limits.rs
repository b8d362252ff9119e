//! Fastly resource limits applied to programs, requests and responses.

use crate::exception::Exception;
use crate::header::Header;
use crate::http::{Request, Response};
use crate::value::Value;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

pub const MAX_URL_SIZE: usize = 8 * KB;
pub const MAX_COOKIE_SIZE: usize = 32 * KB;
pub const MAX_REQUEST_HEADER_SIZE: usize = 69 * KB;
pub const MAX_RESPONSE_HEADER_SIZE: usize = 69 * KB;
pub const MAX_REQUEST_HEADER_COUNT: usize = 96;
pub const MAX_RESPONSE_HEADER_COUNT: usize = 96;
pub const MAX_REQUEST_BODY_PAYLOAD_SIZE: usize = 8 * KB;
pub const MAX_CUSTOM_VCL_FILE_SIZE: usize = MB;
pub const MAX_VARNISH_RESTARTS: i64 = 3;
pub const MAX_LOG_LINE_SIZE: usize = 16 * KB;
/// Raisable through `[simulator] max_acls`.
pub const MAX_ACL_COUNTS: usize = 1000;
/// Raisable through `[simulator] max_backends`.
pub const MAX_BACKEND_COUNTS: usize = 5;

/// Program-level quotas; overrides may only raise the defaults.
pub fn check_resource_limit(
    backends: usize,
    acls: usize,
    override_backends: usize,
    override_acls: usize,
) -> Result<(), Exception> {
    let max_backends = MAX_BACKEND_COUNTS.max(override_backends);
    if backends > max_backends {
        return Err(Exception::system(format!(
            "Max backend count of {max_backends} exceeded"
        )));
    }
    let max_acls = MAX_ACL_COUNTS.max(override_acls);
    if acls > max_acls {
        return Err(Exception::system(format!(
            "Max ACL count of {max_acls} exceeded"
        )));
    }
    Ok(())
}

/// Ingress checks. Cookie and body overflows are repaired in place, the
/// rest reject the request.
pub fn check_request_limit(req: &mut Request) -> Result<(), Exception> {
    if req.url.len() > MAX_URL_SIZE {
        return Err(Exception::system(format!(
            "URL size is limited under the {MAX_URL_SIZE} bytes"
        )));
    }

    let mut cookie_size = 0usize;
    let mut overflow = false;
    for line in req.header.lines("Cookie") {
        for item in line {
            let value = item.value.as_ref().map(|v| v.strict()).unwrap_or_default();
            cookie_size += item.key.strict().len() + 1 + value.len();
        }
        if cookie_size > MAX_COOKIE_SIZE {
            overflow = true;
            break;
        }
    }
    if overflow {
        req.header.del("Cookie");
        req.header.set("Fastly-Cookie-Overflow", Value::string("1"));
    }

    check_header_limit(
        &req.header,
        "request",
        MAX_REQUEST_HEADER_SIZE,
        MAX_REQUEST_HEADER_COUNT,
    )?;

    if matches!(req.method.as_str(), "POST" | "PUT" | "PATCH")
        && req.body.len() > MAX_REQUEST_BODY_PAYLOAD_SIZE
    {
        req.body.clear();
    }
    Ok(())
}

pub fn check_response_limit(resp: &Response) -> Result<(), Exception> {
    check_header_limit(
        &resp.header,
        "response",
        MAX_RESPONSE_HEADER_SIZE,
        MAX_RESPONSE_HEADER_COUNT,
    )
}

fn check_header_limit(
    header: &Header,
    what: &str,
    max_size: usize,
    max_count: usize,
) -> Result<(), Exception> {
    let mut size = 0usize;
    let mut count = 0usize;
    for (name, value) in header.to_pairs() {
        count += 1;
        if count > max_count {
            return Err(Exception::system(format!(
                "Overflow {what} header count limitation of {max_count}"
            )));
        }
        size += name.len() + 2 + value.len();
        if size > max_size {
            return Err(Exception::system(format!(
                "Overflow {what} header size limitation of {max_size} bytes"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        MAX_COOKIE_SIZE, MAX_REQUEST_BODY_PAYLOAD_SIZE, check_request_limit,
        check_resource_limit,
    };
    use crate::http::Request;

    #[test]
    fn long_urls_are_rejected() {
        let mut req = Request::new("GET", &format!("/{}", "a".repeat(9000)));
        let err = check_request_limit(&mut req).expect_err("limit");
        assert_eq!(err.message, "URL size is limited under the 8192 bytes");
    }

    #[test]
    fn oversized_cookie_is_replaced_by_overflow_marker() {
        let mut req = Request::new("GET", "/");
        req.header
            .append_raw("Cookie", &format!("big={}", "x".repeat(MAX_COOKIE_SIZE)));
        check_request_limit(&mut req).expect("repaired");
        assert!(!req.header.contains("Cookie"));
        assert_eq!(req.header.get("Fastly-Cookie-Overflow").strict(), "1");
    }

    #[test]
    fn oversized_post_body_becomes_empty() {
        let mut req = Request::new("POST", "/");
        req.body = vec![b'a'; MAX_REQUEST_BODY_PAYLOAD_SIZE + 1];
        check_request_limit(&mut req).expect("repaired");
        assert!(req.body.is_empty());

        let mut get = Request::new("GET", "/");
        get.body = vec![b'a'; MAX_REQUEST_BODY_PAYLOAD_SIZE + 1];
        check_request_limit(&mut get).expect("ok");
        assert!(!get.body.is_empty());
    }

    #[test]
    fn too_many_headers_fail() {
        let mut req = Request::new("GET", "/");
        for idx in 0..97 {
            req.header.append_raw(&format!("X-H{idx}"), "v");
        }
        let err = check_request_limit(&mut req).expect_err("count");
        assert_eq!(err.message, "Overflow request header count limitation of 96");
    }

    #[test]
    fn overrides_only_raise_quotas() {
        assert!(check_resource_limit(6, 0, 0, 0).is_err());
        assert!(check_resource_limit(6, 0, 10, 0).is_ok());
        assert!(check_resource_limit(5, 0, 1, 0).is_ok());
    }
}
