//! Persisted ACME state
//!
//! Field names and byte encoding match the payload layout already found in
//! existing storage secrets: PascalCase keys, byte sequences as standard
//! base64 strings, `null` accepted wherever a collection may be empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// ACME account registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Contact email
    #[serde(rename = "Email", default)]
    pub email: String,
    /// Registration resource returned by the CA (opaque)
    #[serde(rename = "Registration", default)]
    pub registration: Option<serde_json::Value>,
    /// Account private key
    #[serde(rename = "PrivateKey", default, with = "base64_bytes")]
    pub private_key: Vec<u8>,
    /// Key algorithm, e.g. "RSA4096" or "EC256"
    #[serde(rename = "KeyType", default)]
    pub key_type: String,
}

/// Domains covered by a certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(rename = "Main", default)]
    pub main: String,
    #[serde(rename = "SANs", default, deserialize_with = "nullable")]
    pub sans: Vec<String>,
}

impl Domain {
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            sans: Vec::new(),
        }
    }

    pub fn with_sans(mut self, sans: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Main domain followed by the SANs
    pub fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.main.as_str()).chain(self.sans.iter().map(String::as_str))
    }
}

/// Certificate and private key material for a set of domains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(rename = "Domain", default)]
    pub domain: Domain,
    /// PEM certificate chain
    #[serde(rename = "Certificate", default, with = "base64_bytes")]
    pub certificate: Vec<u8>,
    /// PEM private key
    #[serde(rename = "Key", default, with = "base64_bytes")]
    pub key: Vec<u8>,
}

/// Root record persisted to the backend as a single unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredData {
    #[serde(rename = "Account", default)]
    pub account: Option<Account>,

    /// Issued certificates, in issuance order
    #[serde(rename = "Certificates", default, deserialize_with = "nullable")]
    pub certificates: Vec<Certificate>,

    /// token -> domain -> key authorization
    #[serde(rename = "HTTPChallenges", default, with = "base64_challenges")]
    pub http_challenges: BTreeMap<String, BTreeMap<String, Vec<u8>>>,

    /// domain -> TLS-ALPN-01 challenge certificate
    #[serde(rename = "TLSChallenges", default, deserialize_with = "nullable")]
    pub tls_challenges: BTreeMap<String, Certificate>,
}

/// Deserialize `null` as the type's default value.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

mod base64_challenges {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    type Challenges = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

    pub fn serialize<S: Serializer>(map: &Challenges, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, BTreeMap<&str, String>> = map
            .iter()
            .map(|(token, domains)| {
                let inner = domains
                    .iter()
                    .map(|(domain, key_auth)| (domain.as_str(), STANDARD.encode(key_auth)))
                    .collect();
                (token.as_str(), inner)
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Challenges, D::Error> {
        let raw: Option<BTreeMap<String, Option<BTreeMap<String, Option<String>>>>> =
            Option::deserialize(deserializer)?;

        let mut challenges = Challenges::new();
        for (token, domains) in raw.unwrap_or_default() {
            let mut inner = BTreeMap::new();
            for (domain, key_auth) in domains.unwrap_or_default() {
                let bytes = match key_auth {
                    Some(encoded) => STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(serde::de::Error::custom)?,
                    None => Vec::new(),
                };
                inner.insert(domain, bytes);
            }
            challenges.insert(token, inner);
        }
        Ok(challenges)
    }
}
