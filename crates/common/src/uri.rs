use url::Url;

/// A `bunker://` connection descriptor.
///
/// `bunker://<identifier>?relay=<wss-url>[&relay=…][&secret=<hex>]`
///
/// The identifier is a hex or npub encoding of the endpoint's public
/// key. Relays tell the connecting client where the endpoint listens;
/// the optional secret pre-authorizes the first `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    pub identifier: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BunkerUriError {
    #[error("not a bunker:// URI")]
    WrongScheme,
    #[error("missing identifier")]
    MissingIdentifier,
    #[error("unparseable URI: {0}")]
    Parse(#[from] url::ParseError),
}

impl BunkerUri {
    pub fn new(identifier: impl Into<String>, relays: Vec<String>) -> Self {
        Self {
            identifier: identifier.into(),
            relays,
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn parse(s: &str) -> Result<Self, BunkerUriError> {
        let url = Url::parse(s)?;
        if url.scheme() != "bunker" {
            return Err(BunkerUriError::WrongScheme);
        }
        // the identifier lands in the host position for bunker://x?…
        let identifier = url
            .host_str()
            .map(str::to_string)
            .or_else(|| {
                let path = url.path().trim_start_matches('/');
                (!path.is_empty()).then(|| path.to_string())
            })
            .ok_or(BunkerUriError::MissingIdentifier)?;

        let mut relays = Vec::new();
        let mut secret = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "relay" => relays.push(v.into_owned()),
                "secret" => secret = Some(v.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            identifier,
            relays,
            secret,
        })
    }
}

impl std::fmt::Display for BunkerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bunker://{}", self.identifier)?;
        let mut sep = '?';
        for relay in &self.relays {
            write!(f, "{}relay={}", sep, relay)?;
            sep = '&';
        }
        if let Some(secret) = &self.secret {
            write!(f, "{}secret={}", sep, secret)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let uri = BunkerUri::new(
            "deadbeef",
            vec!["wss://relay.one".to_string(), "wss://relay.two".to_string()],
        )
        .with_secret("cafe");
        let s = uri.to_string();
        assert_eq!(
            s,
            "bunker://deadbeef?relay=wss://relay.one&relay=wss://relay.two&secret=cafe"
        );
        let parsed = BunkerUri::parse(&s).unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn test_parse_without_secret() {
        let parsed = BunkerUri::parse("bunker://abc?relay=wss://r.example").unwrap();
        assert_eq!(parsed.identifier, "abc");
        assert_eq!(parsed.relays, vec!["wss://r.example".to_string()]);
        assert!(parsed.secret.is_none());
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(matches!(
            BunkerUri::parse("https://abc?relay=wss://r"),
            Err(BunkerUriError::WrongScheme)
        ));
    }
}
