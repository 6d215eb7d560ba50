use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use aho_corasick::AhoCorasick;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ThreatPulseError;

/// One rule that matched a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: String,
    pub namespace: String,
    pub metadata: BTreeMap<String, String>,
    pub matched_strings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub matched: bool,
    pub matches: Vec<RuleMatch>,
}

impl ScanOutcome {
    pub fn from_matches(matches: Vec<RuleMatch>) -> Self {
        ScanOutcome {
            matched: !matches.is_empty(),
            matches,
        }
    }
}

/// A pattern-matching engine that tests a file against its compiled rule set.
///
/// Implementations must honor `timeout` by returning
/// [`ThreatPulseError::ScanTimeout`] instead of running past it.
pub trait DetectionEngine: Send + Sync {
    fn scan(&self, path: &Path, timeout: Duration) -> Result<ScanOutcome, ThreatPulseError>;

    /// Reloads rules from their source, returning the number of active rules.
    fn reload(&self) -> Result<usize, ThreatPulseError>;

    fn rule_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringDef {
    pub id: String,
    pub text: Option<String>,
    /// Hex bytes, whitespace ignored: "4d 5a 90 00"
    pub hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub metadata: BTreeMap<String, toml::Value>,
    pub strings: Vec<StringDef>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleDef>,
}

#[derive(Debug, Clone)]
struct CompiledString {
    id: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    namespace: String,
    condition: Condition,
    metadata: BTreeMap<String, String>,
    strings: Vec<CompiledString>,
}

impl CompiledRule {
    fn compile(def: RuleDef) -> Result<Self, ThreatPulseError> {
        if def.name.trim().is_empty() {
            return Err(ThreatPulseError::ScanEngineError(
                "rule with empty name".into(),
            ));
        }
        if def.strings.is_empty() {
            return Err(ThreatPulseError::ScanEngineError(format!(
                "rule '{}' has no strings",
                def.name
            )));
        }

        let mut strings = Vec::with_capacity(def.strings.len());
        for s in def.strings {
            let bytes = match (&s.text, &s.hex) {
                (Some(text), None) => text.as_bytes().to_vec(),
                (None, Some(hex_str)) => {
                    let compact: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
                    hex::decode(&compact).map_err(|e| {
                        ThreatPulseError::ScanEngineError(format!(
                            "rule '{}' string {}: invalid hex: {}",
                            def.name, s.id, e
                        ))
                    })?
                }
                _ => {
                    return Err(ThreatPulseError::ScanEngineError(format!(
                        "rule '{}' string {} needs exactly one of text or hex",
                        def.name, s.id
                    )))
                }
            };
            if bytes.is_empty() {
                return Err(ThreatPulseError::ScanEngineError(format!(
                    "rule '{}' string {} is empty",
                    def.name, s.id
                )));
            }
            strings.push(CompiledString { id: s.id, bytes });
        }

        let metadata = def
            .metadata
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect();

        Ok(CompiledRule {
            name: def.name,
            namespace: def.namespace,
            condition: def.condition,
            metadata,
            strings,
        })
    }
}

/// Compiled rules plus one automaton over every rule string. Swapped as a
/// unit on reload so a scan never sees rules and patterns from different loads.
struct RuleSet {
    rules: Vec<CompiledRule>,
    automaton: Option<AhoCorasick>,
    /// Automaton pattern id -> (rule index, string index)
    pattern_index: Vec<(usize, usize)>,
    longest: usize,
}

impl RuleSet {
    fn empty() -> Self {
        RuleSet {
            rules: Vec::new(),
            automaton: None,
            pattern_index: Vec::new(),
            longest: 0,
        }
    }

    fn build(rules: Vec<CompiledRule>) -> Result<Self, ThreatPulseError> {
        let mut patterns: Vec<&[u8]> = Vec::new();
        let mut pattern_index = Vec::new();
        for (r, rule) in rules.iter().enumerate() {
            for (i, string) in rule.strings.iter().enumerate() {
                patterns.push(string.bytes.as_slice());
                pattern_index.push((r, i));
            }
        }
        let longest = patterns.iter().map(|p| p.len()).max().unwrap_or(0);

        let automaton = if patterns.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(&patterns).map_err(|e| {
                ThreatPulseError::ScanEngineError(format!("cannot build matcher: {}", e))
            })?)
        };

        Ok(RuleSet {
            rules,
            automaton,
            pattern_index,
            longest,
        })
    }
}

/// Literal and hex byte-string matcher driven by a TOML rules file:
///
/// ```toml
/// [[rule]]
/// name = "EICAR_Test_File"
/// namespace = "test"
/// condition = "any"
/// metadata = { severity = "low" }
/// strings = [{ id = "$eicar", text = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE" }]
/// ```
pub struct SignatureEngine {
    rules_path: Option<PathBuf>,
    rules: RwLock<Arc<RuleSet>>,
}

impl SignatureEngine {
    const CHUNK_SIZE: usize = 64 * 1024;

    pub fn from_rules(defs: Vec<RuleDef>) -> Result<Self, ThreatPulseError> {
        let rule_set = Self::compile_all(defs)?;
        Ok(SignatureEngine {
            rules_path: None,
            rules: RwLock::new(Arc::new(rule_set)),
        })
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ThreatPulseError> {
        Self::from_rules(Self::parse(source)?)
    }

    /// Loads rules from `path`. Without a path the engine starts empty and
    /// never matches.
    pub fn load(path: Option<&Path>) -> Result<Self, ThreatPulseError> {
        let engine = SignatureEngine {
            rules_path: path.map(Path::to_path_buf),
            rules: RwLock::new(Arc::new(RuleSet::empty())),
        };
        match path {
            Some(_) => {
                engine.reload()?;
            }
            None => warn!("No rules file configured: files will be hashed but never match"),
        }
        Ok(engine)
    }

    fn parse(source: &str) -> Result<Vec<RuleDef>, ThreatPulseError> {
        let file: RuleFile = toml::from_str(source)
            .map_err(|e| ThreatPulseError::ScanEngineError(format!("invalid rules: {}", e)))?;
        Ok(file.rules)
    }

    fn compile_all(defs: Vec<RuleDef>) -> Result<RuleSet, ThreatPulseError> {
        let rules = defs
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        RuleSet::build(rules)
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        match self.rules.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

impl DetectionEngine for SignatureEngine {
    fn scan(&self, path: &Path, timeout: Duration) -> Result<ScanOutcome, ThreatPulseError> {
        let rule_set = self.snapshot();
        let Some(automaton) = &rule_set.automaton else {
            return Ok(ScanOutcome::default());
        };
        let rules = &rule_set.rules;

        let deadline = Instant::now() + timeout;
        let f = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ThreatPulseError::FileNotFound(path.to_path_buf()),
            _ => ThreatPulseError::ScanEngineError(format!("{}: {}", path.display(), e)),
        })?;
        let mut reader = BufReader::new(f);

        // found[r][s] records whether string s of rule r has been seen
        let mut found: Vec<Vec<bool>> = rules.iter().map(|r| vec![false; r.strings.len()]).collect();
        let overlap = rule_set.longest.saturating_sub(1);
        let mut window: Vec<u8> = Vec::with_capacity(Self::CHUNK_SIZE + overlap);
        let mut chunk = vec![0u8; Self::CHUNK_SIZE];

        loop {
            if Instant::now() >= deadline {
                return Err(ThreatPulseError::ScanTimeout(timeout));
            }

            let bytes_read = reader
                .read(&mut chunk)
                .map_err(|e| ThreatPulseError::ScanEngineError(format!("{}: {}", path.display(), e)))?;
            if bytes_read == 0 {
                break;
            }
            window.extend_from_slice(&chunk[..bytes_read]);

            // Overlapping search so a string contained in another is still reported
            for mat in automaton.find_overlapping_iter(&window) {
                let (r, i) = rule_set.pattern_index[mat.pattern().as_usize()];
                found[r][i] = true;
            }

            // Keep a tail so strings spanning a chunk boundary are still seen
            if window.len() > overlap {
                window.drain(..window.len() - overlap);
            }
        }

        let matches = rules
            .iter()
            .zip(found.iter())
            .filter(|(rule, seen)| match rule.condition {
                Condition::Any => seen.iter().any(|h| *h),
                Condition::All => seen.iter().all(|h| *h),
            })
            .map(|(rule, seen)| RuleMatch {
                rule: rule.name.clone(),
                namespace: rule.namespace.clone(),
                metadata: rule.metadata.clone(),
                matched_strings: rule
                    .strings
                    .iter()
                    .zip(seen.iter())
                    .filter(|(_, hit)| **hit)
                    .map(|(s, _)| s.id.clone())
                    .collect(),
            })
            .collect();

        Ok(ScanOutcome::from_matches(matches))
    }

    fn reload(&self) -> Result<usize, ThreatPulseError> {
        let Some(path) = &self.rules_path else {
            return Ok(self.rule_count());
        };
        let source = fs::read_to_string(path).map_err(|e| {
            ThreatPulseError::ScanEngineError(format!("cannot read rules {}: {}", path.display(), e))
        })?;
        let rule_set = Self::compile_all(Self::parse(&source)?)?;
        let count = rule_set.rules.len();

        match self.rules.write() {
            Ok(mut guard) => *guard = Arc::new(rule_set),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(rule_set),
        }
        info!("Loaded {} detection rules from {}", count, path.display());
        Ok(count)
    }

    fn rule_count(&self) -> usize {
        self.snapshot().rules.len()
    }
}
