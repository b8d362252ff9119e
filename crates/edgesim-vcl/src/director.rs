use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::ast::{BackendDecl, DirectorDecl, ExprKind, PropValue, Property};
use crate::exception::Exception;

/// Declared origin. Health is the only part that changes after init.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub props: Vec<Property>,
    healthy: AtomicBool,
}

impl Backend {
    pub fn from_decl(decl: &BackendDecl) -> Self {
        Self {
            name: decl.name.name.clone(),
            props: decl.props.clone(),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn prop(&self, key: &str) -> Option<&ExprKind> {
        self.props.iter().find_map(|prop| match &prop.value {
            PropValue::Expr(expr) if prop.key.name == key => Some(&expr.kind),
            _ => None,
        })
    }

    pub fn string_prop(&self, key: &str) -> Option<String> {
        match self.prop(key)? {
            ExprKind::String(value) => Some(value.clone()),
            ExprKind::Int(value) => Some(value.to_string()),
            ExprKind::Ident(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn bool_prop(&self, key: &str) -> bool {
        matches!(self.prop(key), Some(ExprKind::Bool(true)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectorKind {
    Random,
    Fallback,
    Hash,
    Client,
    Chash,
    Shield,
}

impl DirectorKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "random" => DirectorKind::Random,
            "fallback" => DirectorKind::Fallback,
            "hash" => DirectorKind::Hash,
            "client" => DirectorKind::Client,
            "chash" => DirectorKind::Chash,
            "shield" => DirectorKind::Shield,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DirectorKind::Random => "random",
            DirectorKind::Fallback => "fallback",
            DirectorKind::Hash => "hash",
            DirectorKind::Client => "client",
            DirectorKind::Chash => "chash",
            DirectorKind::Shield => "shield",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectorError {
    QuorumWeightNotReached,
    AllBackendsFailed,
}

impl fmt::Display for DirectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DirectorError::QuorumWeightNotReached => "Quorum weight not reached",
            DirectorError::AllBackendsFailed => "All backend failed",
        })
    }
}

impl std::error::Error for DirectorError {}

#[derive(Debug)]
pub struct DirectorBackend {
    pub backend: Arc<Backend>,
    pub id: String,
    pub weight: i64,
}

/// Inputs the hashing directors key on.
#[derive(Clone, Copy, Debug)]
pub struct DirectorIdentity<'a> {
    pub request_hash: &'a str,
    pub client_identity: &'a str,
}

#[derive(Debug)]
pub struct Director {
    pub name: String,
    pub kind: DirectorKind,
    pub quorum: i64,
    pub retries: usize,
    /// `object` or `client`; chash only.
    pub key: String,
    pub seed: u32,
    pub vnodes_per_node: i64,
    pub backends: Vec<DirectorBackend>,
}

const RETRY_WAIT: Duration = Duration::from_millis(10);
const RING_SLOTS: u32 = 10_000;
const MAX_VNODES_PER_NODE: i64 = 8_388_608;

impl Director {
    pub fn from_decl(
        decl: &DirectorDecl,
        backends: &HashMap<String, Arc<Backend>>,
    ) -> Result<Self, Exception> {
        let kind = DirectorKind::parse(&decl.kind.name).ok_or_else(|| {
            Exception::runtime(
                decl.kind.span,
                format!("Unexpected director type '{}' provided", decl.kind.name),
            )
        })?;
        let mut director = Director {
            name: decl.name.name.clone(),
            kind,
            quorum: 0,
            retries: 0,
            key: String::from("client"),
            seed: 0,
            vnodes_per_node: 0,
            backends: Vec::new(),
        };
        for prop in &decl.props {
            director.apply_property(prop)?;
        }
        for entry in &decl.backends {
            let backend = director_backend(kind, &entry.props, backends)
                .map_err(|err| err.at(entry.span))?;
            director.backends.push(backend);
        }
        if director.backends.is_empty() && kind != DirectorKind::Shield {
            return Err(Exception::runtime(
                decl.span,
                format!(
                    "At least one backend must be specified in director '{}'",
                    director.name
                ),
            ));
        }
        Ok(director)
    }

    fn apply_property(&mut self, prop: &Property) -> Result<(), Exception> {
        let fail = |message: String| Exception::runtime(prop.span, message);
        let kind = self.kind;
        match prop.key.name.as_str() {
            "quorum" => {
                if kind == DirectorKind::Fallback {
                    return Err(fail(
                        ".quorum field must not be present in fallback director type".into(),
                    ));
                }
                self.quorum = match &prop.value {
                    PropValue::Percent(value) => *value,
                    PropValue::Expr(expr) => match &expr.kind {
                        ExprKind::String(raw) => {
                            raw.trim_end_matches('%').parse::<i64>().map_err(|_| {
                                fail(format!(
                                    "Invalid quorum value '{raw}' found. Value must be percentage string like '50%'"
                                ))
                            })?
                        }
                        _ => {
                            return Err(fail(
                                "quorum value must be percentage prefixed value".into(),
                            ));
                        }
                    },
                    PropValue::Object(_) => {
                        return Err(fail("quorum value must be percentage prefixed value".into()));
                    }
                };
            }
            "retries" => {
                if kind != DirectorKind::Random {
                    return Err(fail(
                        ".retries field must be present only in random director type".into(),
                    ));
                }
                let retries =
                    int_value(&prop.value).ok_or_else(|| fail("retries value must be integer".into()))?;
                self.retries = retries.max(0) as usize;
            }
            "key" => {
                if kind != DirectorKind::Chash {
                    return Err(fail(
                        ".key field must be present only in chash director type".into(),
                    ));
                }
                match &prop.value {
                    PropValue::Expr(expr) => match &expr.kind {
                        ExprKind::Ident(key) if key == "object" || key == "client" => {
                            self.key = key.clone();
                        }
                        ExprKind::Ident(_) => {
                            return Err(fail(
                                ".key value must be either of object or client".into(),
                            ));
                        }
                        _ => return Err(fail(".key value must be an identifier".into())),
                    },
                    _ => return Err(fail(".key value must be an identifier".into())),
                }
            }
            "seed" => {
                if kind != DirectorKind::Chash {
                    return Err(fail(
                        ".seed field must be present only in chash director type".into(),
                    ));
                }
                let seed =
                    int_value(&prop.value).ok_or_else(|| fail(".seed value must be integer".into()))?;
                self.seed = seed as u32;
            }
            "vnodes_per_node" => {
                if kind != DirectorKind::Chash {
                    return Err(fail(
                        ".vnodes_per_node field must be present only in chash director type".into(),
                    ));
                }
                let vnodes = int_value(&prop.value)
                    .ok_or_else(|| fail(".vnodes_per_node value must be integer".into()))?;
                if vnodes > MAX_VNODES_PER_NODE {
                    return Err(fail(
                        ".vnodes_per_node value is limited under 8388608".into(),
                    ));
                }
                self.vnodes_per_node = vnodes;
            }
            other => {
                return Err(fail(format!("Unexpected director property '{other}' found")));
            }
        }
        Ok(())
    }

    /// Healthy as long as an election could currently succeed.
    pub fn is_healthy(&self) -> bool {
        match self.kind {
            DirectorKind::Fallback => self.backends.iter().any(|b| b.backend.is_healthy()),
            DirectorKind::Shield => false,
            _ => self.can_determine_backend().is_ok(),
        }
    }

    /// Runs this director's election.
    pub fn select(&self, ident: DirectorIdentity<'_>) -> Result<Arc<Backend>, Exception> {
        let picked = match self.kind {
            DirectorKind::Random => self.random(),
            DirectorKind::Fallback => self.fallback(),
            DirectorKind::Hash => self.hash(ident),
            DirectorKind::Client => self.client(ident),
            DirectorKind::Chash => self.consistent_hash(ident),
            DirectorKind::Shield => {
                return Err(Exception::system(format!(
                    "Unexpected director type '{}' provided",
                    self.kind.as_str()
                )));
            }
        };
        picked.map_err(|err| Exception::runtime_bare(err.to_string()))
    }

    fn can_determine_backend(&self) -> Result<(), DirectorError> {
        let healthy = self.healthy().count();
        if healthy == 0 {
            return Err(DirectorError::AllBackendsFailed);
        }
        let percent = (healthy as f64 / self.backends.len() as f64 * 100.0) as i64;
        if percent < self.quorum {
            return Err(DirectorError::QuorumWeightNotReached);
        }
        Ok(())
    }

    fn healthy(&self) -> impl Iterator<Item = &DirectorBackend> {
        self.backends.iter().filter(|b| b.backend.is_healthy())
    }

    pub fn random(&self) -> Result<Arc<Backend>, DirectorError> {
        let attempts = if self.retries == 0 {
            self.backends.len()
        } else {
            self.retries
        };
        for _ in 0..attempts {
            if self.can_determine_backend().is_err() {
                thread::sleep(RETRY_WAIT);
                continue;
            }
            let lottery: Vec<&DirectorBackend> = self
                .healthy()
                .flat_map(|b| std::iter::repeat_n(b, b.weight.max(0) as usize))
                .collect();
            if lottery.is_empty() {
                break;
            }
            let slot = (random_u64() % lottery.len() as u64) as usize;
            return Ok(Arc::clone(&lottery[slot].backend));
        }
        Err(DirectorError::QuorumWeightNotReached)
    }

    pub fn fallback(&self) -> Result<Arc<Backend>, DirectorError> {
        self.healthy()
            .next()
            .map(|b| Arc::clone(&b.backend))
            .ok_or(DirectorError::AllBackendsFailed)
    }

    pub fn hash(&self, ident: DirectorIdentity<'_>) -> Result<Arc<Backend>, DirectorError> {
        self.backend_by_hash(&Sha256::digest(ident.request_hash.as_bytes()))
    }

    pub fn client(&self, ident: DirectorIdentity<'_>) -> Result<Arc<Backend>, DirectorError> {
        self.backend_by_hash(&Sha256::digest(ident.client_identity.as_bytes()))
    }

    fn backend_by_hash(&self, digest: &[u8]) -> Result<Arc<Backend>, DirectorError> {
        self.can_determine_backend()?;
        let key = be_u64(digest);
        for exponent in (4..=16).step_by(2) {
            let window = 10u64.pow(exponent);
            let num = key % window;
            for candidate in self.healthy() {
                // Keyed on the backend name, as the chash ring is, so editing a
                // backend's properties does not move its requests.
                let slot = be_u64(&Sha256::digest(candidate.backend.name.as_bytes())) % (window * 10);
                if slot >= num && slot < num + window {
                    return Ok(Arc::clone(&candidate.backend));
                }
            }
        }
        self.fallback()
    }

    pub fn consistent_hash(
        &self,
        ident: DirectorIdentity<'_>,
    ) -> Result<Arc<Backend>, DirectorError> {
        self.can_determine_backend()?;
        let mut ring: Vec<(u32, &DirectorBackend)> = Vec::new();
        for candidate in self.healthy() {
            for replica in 0..3 {
                let mut hasher = Sha256::new();
                hasher.update(self.seed.to_be_bytes());
                hasher.update(candidate.backend.name.as_bytes());
                hasher.update(replica.to_string().as_bytes());
                let point = be_u32(&hasher.finalize()) % RING_SLOTS;
                ring.push((point, candidate));
            }
        }
        // Later placements win a shared slot.
        ring.sort_by_key(|(point, _)| *point);
        ring.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                earlier.1 = later.1;
                true
            } else {
                false
            }
        });
        let source = if self.key == "object" {
            ident.request_hash
        } else {
            ident.client_identity
        };
        let key = be_u32(&Sha256::digest(source.as_bytes())) % RING_SLOTS;
        let index = ring.partition_point(|(point, _)| *point < key);
        let (_, picked) = ring
            .get(index)
            .or_else(|| ring.first())
            .ok_or(DirectorError::AllBackendsFailed)?;
        Ok(Arc::clone(&picked.backend))
    }
}

fn director_backend(
    kind: DirectorKind,
    props: &[Property],
    backends: &HashMap<String, Arc<Backend>>,
) -> Result<DirectorBackend, Exception> {
    let mut backend = None;
    let mut id = String::new();
    let mut weight = 0;
    for prop in props {
        let fail = |message: String| Exception::runtime(prop.span, message);
        let expr = match &prop.value {
            PropValue::Expr(expr) => Some(&expr.kind),
            _ => None,
        };
        match prop.key.name.as_str() {
            "backend" => {
                let Some(ExprKind::Ident(name)) = expr else {
                    return Err(fail("backend value must be percentage prefixed value".into()));
                };
                let found = backends
                    .get(name)
                    .ok_or_else(|| fail(format!("backend '{name}' is not found")))?;
                backend = Some(Arc::clone(found));
            }
            "id" => {
                let Some(ExprKind::String(value)) = expr else {
                    return Err(fail("id value must be a string".into()));
                };
                id = value.clone();
            }
            "weight" => {
                let Some(ExprKind::Int(value)) = expr else {
                    return Err(fail("weight value must be an integer".into()));
                };
                weight = *value;
            }
            other => {
                return Err(fail(format!(
                    "Unexpected director backend property '{other}' found"
                )));
            }
        }
    }
    match kind {
        DirectorKind::Random | DirectorKind::Hash | DirectorKind::Client if weight == 0 => {
            return Err(Exception::runtime_bare(format!(
                ".weight property must be set when director type is '{}'",
                kind.as_str()
            )));
        }
        DirectorKind::Chash if id.is_empty() => {
            return Err(Exception::runtime_bare(format!(
                ".id property must be set when director type is '{}'",
                kind.as_str()
            )));
        }
        _ => {}
    }
    let backend = backend
        .ok_or_else(|| Exception::runtime_bare("director backend must specify .backend"))?;
    Ok(DirectorBackend {
        backend,
        id,
        weight,
    })
}

fn int_value(value: &PropValue) -> Option<i64> {
    match value {
        PropValue::Expr(expr) => match expr.kind {
            ExprKind::Int(v) => Some(v),
            _ => None,
        },
        _ => None,
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

fn random_u64() -> u64 {
    let mut buf = [0u8; 8];
    if getrandom::fill(&mut buf).is_err() {
        return 0;
    }
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::{Backend, Director, DirectorError, DirectorIdentity};
    use crate::ast::Decl;

    const BACKENDS: &str = r#"
backend test01 { .host = "example01.com"; .port = "443"; }
backend test02 { .host = "example02.com"; .port = "443"; }
backend test03 { .host = "example03.com"; .port = "443"; }
"#;

    const IDENT: DirectorIdentity<'static> = DirectorIdentity {
        request_hash: "/?foo=bar",
        client_identity: "127.0.0.1",
    };

    fn setup(director: &str) -> (HashMap<String, Arc<Backend>>, Result<Director, String>) {
        setup_with(BACKENDS, director)
    }

    fn setup_with(backends_src: &str, director: &str) -> (HashMap<String, Arc<Backend>>, Result<Director, String>) {
        let src = format!("{backends_src}\n{director}");
        let (program, diags) = crate::parse_source(&src, "director.vcl");
        assert!(diags.is_empty(), "{diags:?}");
        let mut backends = HashMap::new();
        let mut result = Err("no director".to_string());
        for decl in &program.decls {
            match decl {
                Decl::Backend(decl) => {
                    backends.insert(decl.name.name.clone(), Arc::new(Backend::from_decl(decl)));
                }
                Decl::Director(decl) => {
                    result = Director::from_decl(decl, &backends).map_err(|err| err.message);
                }
                _ => {}
            }
        }
        (backends, result)
    }

    fn pick_counts(director: &Director, pick: impl Fn(&Director) -> Arc<Backend>) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(pick(director).name.clone()).or_insert(0) += 1;
        }
        counts
    }

    const RANDOM: &str = r#"
director test random {
  .quorum  = 50%;
  .retries = 3;
  { .backend = test01; .weight = 2; }
  { .backend = test02; .weight = 1; }
  { .backend = test03; .weight = 1; }
}"#;

    #[test]
    fn random_rejects_when_quorum_is_lost() {
        let (backends, director) = setup(RANDOM);
        let director = director.expect("director");
        backends["test01"].set_healthy(false);
        backends["test02"].set_healthy(false);
        assert_eq!(director.random().err(), Some(DirectorError::QuorumWeightNotReached));
    }

    #[test]
    fn random_respects_weights_and_health() {
        let (backends, director) = setup(RANDOM);
        let director = director.expect("director");
        let counts = pick_counts(&director, |d| d.random().expect("pick"));
        let share = |name: &str| counts.get(name).copied().unwrap_or(0) / 100;
        assert!((45..=55).contains(&share("test01")), "{counts:?}");
        assert!((20..=30).contains(&share("test02")), "{counts:?}");

        backends["test03"].set_healthy(false);
        let counts = pick_counts(&director, |d| d.random().expect("pick"));
        assert!(!counts.contains_key("test03"));
    }

    #[test]
    fn fallback_skips_unhealthy_backends() {
        let (backends, director) = setup(
            "director test fallback { { .backend = test01; } { .backend = test02; } { .backend = test03; } }",
        );
        let director = director.expect("director");
        backends["test01"].set_healthy(false);
        assert_eq!(director.fallback().expect("pick").name, "test02");
        backends["test02"].set_healthy(false);
        backends["test03"].set_healthy(false);
        assert_eq!(director.fallback().err(), Some(DirectorError::AllBackendsFailed));
    }

    #[test]
    fn hash_and_client_are_sticky() {
        let (backends, hash) = setup(
            "director test hash { .quorum = 50%; { .backend = test01; .weight = 1; } { .backend = test02; .weight = 1; } { .backend = test03; .weight = 1; } }",
        );
        let hash = hash.expect("director");
        let counts = pick_counts(&hash, |d| d.hash(IDENT).expect("pick"));
        assert_eq!(counts.get("test01"), Some(&10_000));

        let (_, client) = setup(
            "director test client { .quorum = 50%; { .backend = test01; .weight = 1; } { .backend = test02; .weight = 1; } { .backend = test03; .weight = 1; } }",
        );
        let client = client.expect("director");
        let counts = pick_counts(&client, |d| d.client(IDENT).expect("pick"));
        assert_eq!(counts.get("test01"), Some(&10_000));

        backends["test01"].set_healthy(false);
        backends["test02"].set_healthy(false);
        assert_eq!(hash.hash(IDENT).err(), Some(DirectorError::QuorumWeightNotReached));
    }

    #[test]
    fn hash_placement_ignores_backend_properties() {
        const HASH: &str = "director test hash { { .backend = test01; } { .backend = test02; } { .backend = test03; } }";
        let moved = r#"
backend test01 { .host = "origin-a.internal"; .port = "8080"; .ssl = true; }
backend test02 { .host = "origin-b.internal"; .port = "80"; }
backend test03 { .host = "origin-c.internal"; .port = "80"; .first_byte_timeout = 5s; }
"#;
        let (_, before) = setup(HASH);
        let (_, after) = setup_with(moved, HASH);
        let (before, after) = (before.expect("director"), after.expect("director"));
        for idx in 0..200 {
            let request_hash = format!("/item/{idx}");
            let ident = DirectorIdentity {
                request_hash: &request_hash,
                client_identity: "127.0.0.1",
            };
            assert_eq!(
                before.hash(ident).expect("pick").name,
                after.hash(ident).expect("pick").name,
                "{request_hash}"
            );
        }
    }

    #[test]
    fn consistent_hash_follows_the_ring() {
        let object = r#"director test chash { .quorum = 50%; .seed = 1; .key = object;
  { .backend = test01; .id = "b01"; } { .backend = test02; .id = "b02"; } { .backend = test03; .id = "b03"; } }"#;
        let (backends, director) = setup(object);
        let director = director.expect("director");
        let counts = pick_counts(&director, |d| d.consistent_hash(IDENT).expect("pick"));
        assert_eq!(counts.get("test03"), Some(&10_000));

        backends["test03"].set_healthy(false);
        assert_eq!(director.consistent_hash(IDENT).expect("pick").name, "test02");

        let (_, by_client) = setup(&object.replace(".key = object", ".key = client"));
        let by_client = by_client.expect("director");
        assert_eq!(by_client.consistent_hash(IDENT).expect("pick").name, "test01");
    }

    #[test]
    fn validates_director_properties() {
        let cases = [
            (
                "director d fallback { .quorum = 50%; { .backend = test01; } }",
                ".quorum field must not be present in fallback director type",
            ),
            (
                "director d hash { .retries = 3; { .backend = test01; .weight = 1; } }",
                ".retries field must be present only in random director type",
            ),
            (
                "director d random { { .backend = test01; } }",
                ".weight property must be set when director type is 'random'",
            ),
            (
                "director d chash { .key = host; { .backend = test01; .id = \"a\"; } }",
                ".key value must be either of object or client",
            ),
            (
                "director d chash { { .backend = test01; } }",
                ".id property must be set when director type is 'chash'",
            ),
            (
                "director d random { { .backend = missing; .weight = 1; } }",
                "backend 'missing' is not found",
            ),
            (
                "director d round_robin { { .backend = test01; } }",
                "Unexpected director type 'round_robin' provided",
            ),
            (
                "director d random { }",
                "At least one backend must be specified in director 'd'",
            ),
            (
                "director d chash { .vnodes_per_node = 9000000; { .backend = test01; .id = \"a\"; } }",
                ".vnodes_per_node value is limited under 8388608",
            ),
        ];
        for (src, want) in cases {
            let (_, result) = setup(src);
            assert_eq!(result.err().as_deref(), Some(want), "{src}");
        }
        let (_, shield) = setup("director d shield { }");
        assert!(shield.is_ok());
    }
}
