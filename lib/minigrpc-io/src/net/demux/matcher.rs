/// Request-line method tokens that identify an HTTP/1.x client.
const HTTP1_METHODS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

/// Upper bound on how many bytes any matcher needs to reach a verdict.
pub(super) const MAX_SNIFF_LEN: usize = 16;

/// A connection matcher.
///
/// Matchers classify a connection from the first application bytes it sends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Matcher {
    /// Matches connections whose first bytes are an HTTP/1.x request line: a known method token followed by a space.
    ///
    /// The HTTP/2 connection preface (`PRI * HTTP/2.0`) never matches.
    Http1,

    /// Matches every connection.
    Any,
}

/// Result of evaluating a matcher against a connection prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Verdict {
    Match,
    NoMatch,
    NeedMore,
}

/// Routing decision across an ordered set of matchers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Decision {
    Route(usize),
    NeedMore,
    Unmatched,
}

impl Matcher {
    /// Returns the route name of the matcher, used in logs and metrics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Http1 => "http1",
            Self::Any => "any",
        }
    }

    pub(super) fn evaluate(&self, prefix: &[u8]) -> Verdict {
        match self {
            Self::Any => Verdict::Match,
            Self::Http1 => evaluate_http1(prefix),
        }
    }
}

fn evaluate_http1(prefix: &[u8]) -> Verdict {
    let mut verdict = Verdict::NoMatch;

    for method in HTTP1_METHODS {
        let token_len = method.len() + 1;
        if prefix.len() >= token_len {
            if prefix.starts_with(method) && prefix[method.len()] == b' ' {
                return Verdict::Match;
            }
        } else {
            // The prefix is still a candidate for this method if everything we have so far lines up with it.
            let candidate = method
                .iter()
                .chain(std::iter::once(&b' '))
                .zip(prefix)
                .all(|(expected, actual)| expected == actual);
            if candidate {
                verdict = Verdict::NeedMore;
            }
        }
    }

    verdict
}

/// Picks the first matcher, in order, that accepts the prefix.
///
/// A matcher that needs more bytes blocks every matcher after it, so earlier routes always win. Once `complete` is set
/// (the peer stopped sending), undecided matchers are treated as non-matching.
pub(super) fn select_route(matchers: &[Matcher], prefix: &[u8], complete: bool) -> Decision {
    for (idx, matcher) in matchers.iter().enumerate() {
        match matcher.evaluate(prefix) {
            Verdict::Match => return Decision::Route(idx),
            Verdict::NeedMore if !complete => return Decision::NeedMore,
            Verdict::NeedMore | Verdict::NoMatch => {}
        }
    }

    Decision::Unmatched
}

#[cfg(test)]
mod tests {
    use super::*;

    const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    #[test]
    fn http1_request_lines_match() {
        for line in [
            &b"GET / HTTP/1.1\r\n"[..],
            b"POST /minigrpc.demo.Echo/Echo HTTP/1.1\r\n",
            b"OPTIONS * HTTP/1.1\r\n",
            b"CONNECT example.com:443 HTTP/1.1\r\n",
        ] {
            assert_eq!(Matcher::Http1.evaluate(line), Verdict::Match);
        }
    }

    #[test]
    fn h2_preface_does_not_match_http1() {
        assert_eq!(Matcher::Http1.evaluate(H2_PREFACE), Verdict::NoMatch);
        assert_eq!(Matcher::Http1.evaluate(b"PR"), Verdict::NoMatch);
    }

    #[test]
    fn partial_method_needs_more() {
        assert_eq!(Matcher::Http1.evaluate(b""), Verdict::NeedMore);
        assert_eq!(Matcher::Http1.evaluate(b"P"), Verdict::NeedMore);
        assert_eq!(Matcher::Http1.evaluate(b"POS"), Verdict::NeedMore);
        assert_eq!(Matcher::Http1.evaluate(b"POST"), Verdict::NeedMore);
    }

    #[test]
    fn method_without_space_does_not_match() {
        assert_eq!(Matcher::Http1.evaluate(b"GETX / HTTP/1.1"), Verdict::NoMatch);
        assert_eq!(Matcher::Http1.evaluate(b"get / HTTP/1.1"), Verdict::NoMatch);
    }

    #[test]
    fn first_matching_route_wins() {
        let matchers = [Matcher::Http1, Matcher::Any];
        assert_eq!(select_route(&matchers, b"GET / HTTP/1.1", false), Decision::Route(0));
        assert_eq!(select_route(&matchers, H2_PREFACE, false), Decision::Route(1));

        let catch_all_first = [Matcher::Any, Matcher::Http1];
        assert_eq!(
            select_route(&catch_all_first, b"GET / HTTP/1.1", false),
            Decision::Route(0)
        );
    }

    #[test]
    fn undecided_earlier_route_blocks_later_routes() {
        let matchers = [Matcher::Http1, Matcher::Any];
        assert_eq!(select_route(&matchers, b"GE", false), Decision::NeedMore);

        // Once the peer stops sending, the catch-all takes whatever is left.
        assert_eq!(select_route(&matchers, b"GE", true), Decision::Route(1));
    }

    #[test]
    fn nothing_matches_without_catch_all() {
        assert_eq!(select_route(&[Matcher::Http1], H2_PREFACE, false), Decision::Unmatched);
        assert_eq!(select_route(&[], b"GET / HTTP/1.1", false), Decision::Unmatched);
    }

    #[test]
    fn sniff_window_covers_every_method() {
        assert!(HTTP1_METHODS.iter().all(|method| method.len() < MAX_SNIFF_LEN));
    }
}
