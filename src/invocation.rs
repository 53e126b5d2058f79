//! Decoding of the proxy's service argument
//!
//! qrexec hands the proxy a single argument of the form
//! `<chain>+<domain>+<service>[+<trailing>...]`. Two-segment arguments
//! (`<domain>+<service>`) and an empty first segment both mean "no chain".

use crate::error::{ProxyError, Result};

/// Segment delimiter used by qrexec service arguments
pub const SEGMENT_DELIMITER: char = '+';

/// Fully decoded invocation target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationTarget {
    /// Chain to apply, `None` for a plain forward
    pub chain: Option<String>,
    /// Where the next hop lives
    pub hop: NextHop,
}

/// Destination of the outbound transport leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    /// Destination domain (VM name or `@dispvm`-style keyword)
    pub domain: String,
    /// Destination service name
    pub service: String,
    /// Segments passed through verbatim to the next hop
    pub arguments: Vec<String>,
}

impl NextHop {
    /// The service call as seen by the next hop: `service[+arg...]`
    pub fn call(&self) -> String {
        let mut call = self.service.clone();
        for arg in &self.arguments {
            call.push(SEGMENT_DELIMITER);
            call.push_str(arg);
        }
        call
    }
}

impl InvocationTarget {
    /// Decode a raw service argument.
    pub fn parse(raw: &str) -> Result<Self> {
        let segments: Vec<&str> = raw.split(SEGMENT_DELIMITER).collect();

        let (chain, domain, service, rest) = match segments.as_slice() {
            [] | [_] => {
                return Err(ProxyError::MalformedInvocation(format!(
                    "expected [chain]+<domain>+<service>, got '{raw}'"
                )))
            }
            [domain, service] => (None, *domain, *service, &[][..]),
            [chain, domain, service, rest @ ..] => (Some(*chain), *domain, *service, rest),
        };

        if domain.is_empty() {
            return Err(ProxyError::MalformedInvocation(format!(
                "destination domain is empty in '{raw}'"
            )));
        }
        if service.is_empty() {
            return Err(ProxyError::MalformedInvocation(format!(
                "destination service is empty in '{raw}'"
            )));
        }

        Ok(Self {
            chain: chain.filter(|c| !c.is_empty()).map(str::to_string),
            hop: NextHop {
                domain: domain.to_string(),
                service: service.to_string(),
                arguments: rest.iter().map(|s| s.to_string()).collect(),
            },
        })
    }

    pub fn chain(&self) -> Option<&str> {
        self.chain.as_deref()
    }
}

impl std::str::FromStr for InvocationTarget {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
