//! Pipeline phases and the operator-selected skip set.

use std::fmt;
use std::str::FromStr;

use crate::error::{CcupError, Result};

/// One stage of the apply pipeline, declared in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Infrastructure,
    Init,
    AttestationConfig,
    CertSans,
    Helm,
    K8s,
    Image,
}

impl Phase {
    /// All phases in dependency order.
    pub const ALL: [Phase; 7] = [
        Phase::Infrastructure,
        Phase::Init,
        Phase::AttestationConfig,
        Phase::CertSans,
        Phase::Helm,
        Phase::K8s,
        Phase::Image,
    ];

    /// Canonical flag name, as accepted by `--skip-phases`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure",
            Self::Init => "init",
            Self::AttestationConfig => "attestationconfig",
            Self::CertSans => "certsans",
            Self::Helm => "helm",
            Self::K8s => "k8s",
            Self::Image => "image",
        }
    }

    /// Human-readable title for progress output.
    pub const fn title(self) -> &'static str {
        match self {
            Self::Infrastructure => "Infrastructure",
            Self::Init => "Init",
            Self::AttestationConfig => "Attestation Config",
            Self::CertSans => "Cert SANs",
            Self::Helm => "Helm",
            Self::K8s => "Kubernetes Components",
            Self::Image => "Node Image",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = CcupError;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(token))
            .ok_or_else(|| CcupError::InvalidPhaseName(token.to_string()))
    }
}

/// Canonical phase names in pipeline order.
pub fn all_phases() -> Vec<&'static str> {
    Phase::ALL.iter().map(|p| p.name()).collect()
}

/// Set of phases to skip, stored as a bitset over [`Phase`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Parse a list of comma-separated phase names.
    ///
    /// Every unrecognized token is reported together; no partial set is
    /// returned. Empty tokens are ignored and duplicates collapse.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let mut set = Self::new();
        let mut invalid = Vec::new();

        for token in values
            .iter()
            .flat_map(|v| v.as_ref().split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            match token.parse::<Phase>() {
                Ok(phase) => set.add(&[phase]),
                Err(_) => invalid.push(token.to_string()),
            }
        }

        if invalid.is_empty() {
            Ok(set)
        } else {
            Err(CcupError::InvalidPhaseName(invalid.join(", ")))
        }
    }

    pub const fn contains(&self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn add(&mut self, phases: &[Phase]) {
        for phase in phases {
            self.0 |= phase.bit();
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = Phase> + '_ {
        Phase::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

impl FromIterator<Phase> for PhaseSet {
    fn from_iter<I: IntoIterator<Item = Phase>>(iter: I) -> Self {
        let mut set = Self::new();
        for phase in iter {
            set.add(&[phase]);
        }
        set
    }
}

impl fmt::Display for PhaseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Phase::name).collect();
        f.write_str(&names.join(","))
    }
}
