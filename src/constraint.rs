// Constraints - security and transport requirements attached to a discovery
// exchange, and the checker that matches them against a wire format

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};

/// A single atomic constraint, or a disjunction of alternatives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constraint {
    Integrity(bool),
    Confidentiality(bool),
    ServerAuthentication(bool),
    ClientAuthentication(bool),
    Delegation(bool),
    AtomicInputValidation(bool),
    /// Connection must be established within this many ms of the attempt
    ConnectionRelativeTime(u64),
    /// Connection must be established before this absolute time (ms since epoch)
    ConnectionAbsoluteTime(u64),
    /// Bound on each individual read or write of a unicast exchange (ms)
    UnicastSocketTimeout(u64),
    MulticastMaxPacketSize(u32),
    MulticastTimeToLive(u32),
    DiscoveryProtocolVersion(u32),
    /// Satisfied when any one member is satisfied
    Alternatives(Vec<Constraint>),
}

impl Constraint {
    /// The constraint with the opposite boolean value, for the yes/no kinds.
    pub fn negated(&self) -> Option<Constraint> {
        match *self {
            Constraint::Integrity(v) => Some(Constraint::Integrity(!v)),
            Constraint::Confidentiality(v) => Some(Constraint::Confidentiality(!v)),
            Constraint::ServerAuthentication(v) => Some(Constraint::ServerAuthentication(!v)),
            Constraint::ClientAuthentication(v) => Some(Constraint::ClientAuthentication(!v)),
            Constraint::Delegation(v) => Some(Constraint::Delegation(!v)),
            Constraint::AtomicInputValidation(v) => Some(Constraint::AtomicInputValidation(!v)),
            _ => None,
        }
    }

    fn make_absolute(&self, now: u64) -> Constraint {
        match self {
            Constraint::ConnectionRelativeTime(ms) => {
                Constraint::ConnectionAbsoluteTime(now.saturating_add(*ms))
            }
            Constraint::Alternatives(alternatives) => Constraint::Alternatives(
                alternatives.iter().map(|c| c.make_absolute(now)).collect(),
            ),
            other => other.clone(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConstraintLists {
    #[serde(default)]
    requirements: Vec<Constraint>,
    #[serde(default)]
    preferences: Vec<Constraint>,
}

/// Requirements (must hold) and preferences (should hold if possible).
///
/// Both sets are kept sorted so equal constraint sets compare and hash
/// equal regardless of the order they were built in. A constraint that is
/// both required and preferred is kept only as a requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ConstraintLists", into = "ConstraintLists")]
pub struct InvocationConstraints {
    requirements: BTreeSet<Constraint>,
    preferences: BTreeSet<Constraint>,
}

impl InvocationConstraints {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(
        requirements: impl IntoIterator<Item = Constraint>,
        preferences: impl IntoIterator<Item = Constraint>,
    ) -> Result<Self> {
        let requirements: BTreeSet<Constraint> = requirements.into_iter().collect();
        for constraint in &requirements {
            if let Some(negated) = constraint.negated() {
                if requirements.contains(&negated) {
                    return Err(Error::IncoherentConstraints(constraint.clone()));
                }
            }
        }
        let preferences = preferences
            .into_iter()
            .filter(|c| !requirements.contains(c))
            .collect();
        Ok(Self {
            requirements,
            preferences,
        })
    }

    pub fn requiring(requirements: impl IntoIterator<Item = Constraint>) -> Result<Self> {
        Self::new(requirements, [])
    }

    pub fn requirements(&self) -> &BTreeSet<Constraint> {
        &self.requirements
    }

    pub fn preferences(&self) -> &BTreeSet<Constraint> {
        &self.preferences
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.preferences.is_empty()
    }

    /// Union of both sets, failing if the combined requirements contradict.
    pub fn combine(&self, other: &InvocationConstraints) -> Result<Self> {
        Self::new(
            self.requirements.iter().chain(&other.requirements).cloned(),
            self.preferences.iter().chain(&other.preferences).cloned(),
        )
    }

    /// Converts relative connection deadlines into absolute ones anchored
    /// at `now` (ms since epoch).
    #[must_use]
    pub fn make_absolute(&self, now: u64) -> Self {
        Self {
            requirements: self.requirements.iter().map(|c| c.make_absolute(now)).collect(),
            preferences: self.preferences.iter().map(|c| c.make_absolute(now)).collect(),
        }
    }

    fn all(&self) -> impl Iterator<Item = &Constraint> {
        self.requirements.iter().chain(&self.preferences)
    }

    /// Earliest connection deadline (ms since epoch) for an attempt
    /// starting at `start`.
    pub fn connection_deadline(&self, start: u64) -> Option<u64> {
        self.all()
            .filter_map(|c| match c {
                Constraint::ConnectionRelativeTime(ms) => Some(start.saturating_add(*ms)),
                Constraint::ConnectionAbsoluteTime(at) => Some(*at),
                _ => None,
            })
            .min()
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.all()
            .filter_map(|c| match c {
                Constraint::UnicastSocketTimeout(ms) => Some(Duration::from_millis(*ms)),
                _ => None,
            })
            .min()
    }

    pub fn max_packet_size(&self) -> Option<usize> {
        self.all()
            .filter_map(|c| match c {
                Constraint::MulticastMaxPacketSize(size) => usize::try_from(*size).ok(),
                _ => None,
            })
            .min()
    }

    pub fn time_to_live(&self) -> Option<u32> {
        self.all()
            .filter_map(|c| match c {
                Constraint::MulticastTimeToLive(ttl) => Some(*ttl),
                _ => None,
            })
            .min()
    }

    /// Whether the constraint appears as a requirement, directly or as the
    /// sole alternative of a disjunction.
    pub fn requires(&self, constraint: &Constraint) -> bool {
        self.requirements.iter().any(|c| match c {
            Constraint::Alternatives(alternatives) => {
                alternatives.len() == 1 && alternatives[0] == *constraint
            }
            other => other == constraint,
        })
    }

    /// Whether the constraint is required or preferred.
    pub fn wants(&self, constraint: &Constraint) -> bool {
        self.requires(constraint) || self.preferences.contains(constraint)
    }
}

impl TryFrom<ConstraintLists> for InvocationConstraints {
    type Error = Error;

    fn try_from(lists: ConstraintLists) -> Result<Self> {
        Self::new(lists.requirements, lists.preferences)
    }
}

impl From<InvocationConstraints> for ConstraintLists {
    fn from(constraints: InvocationConstraints) -> Self {
        Self {
            requirements: constraints.requirements.into_iter().collect(),
            preferences: constraints.preferences.into_iter().collect(),
        }
    }
}

/// Decides which constraints a wire format can enforce.
pub trait ConstraintChecker: Send + Sync + std::fmt::Debug {
    fn format_name(&self) -> &str;

    /// Whether the format enforces this atomic constraint.
    fn supports(&self, constraint: &Constraint) -> bool;

    /// Validates `constraints` against the format.
    ///
    /// Fails on the first unsatisfiable requirement. On success returns the
    /// constraints the exchange will actually honour: every requirement
    /// plus the supported preferences, with disjunctions narrowed to their
    /// supported members. A fixed input always yields the same answer.
    fn check_constraints(&self, constraints: &InvocationConstraints) -> Result<InvocationConstraints> {
        let mut requirements = BTreeSet::new();
        for constraint in constraints.requirements() {
            match narrow(self, constraint) {
                Some(satisfied) => {
                    requirements.insert(satisfied);
                }
                None => {
                    return Err(Error::UnsupportedConstraint {
                        constraint: constraint.clone(),
                        format: self.format_name().to_string(),
                    })
                }
            }
        }
        let preferences = constraints
            .preferences()
            .iter()
            .filter_map(|c| narrow(self, c))
            .collect::<Vec<_>>();
        // Disjunctions narrowed to their supported members may contradict
        InvocationConstraints::new(requirements, preferences).map_err(|e| match e {
            Error::IncoherentConstraints(constraint) => Error::UnsupportedConstraint {
                constraint,
                format: self.format_name().to_string(),
            },
            other => other,
        })
    }
}

fn narrow<C: ConstraintChecker + ?Sized>(checker: &C, constraint: &Constraint) -> Option<Constraint> {
    match constraint {
        Constraint::Alternatives(alternatives) => {
            let mut supported: Vec<Constraint> =
                alternatives.iter().filter_map(|c| narrow(checker, c)).collect();
            match supported.len() {
                0 => None,
                1 => supported.pop(),
                _ => Some(Constraint::Alternatives(supported)),
            }
        }
        atomic => checker.supports(atomic).then(|| atomic.clone()),
    }
}

/// Format-independent constraints every discovery format honours: deadlines,
/// multicast sizing and the protocol version.
pub fn supports_transport(constraint: &Constraint) -> bool {
    match constraint {
        Constraint::ConnectionRelativeTime(_)
        | Constraint::ConnectionAbsoluteTime(_)
        | Constraint::UnicastSocketTimeout(_)
        | Constraint::MulticastTimeToLive(_) => true,
        Constraint::MulticastMaxPacketSize(size) => *size >= crate::discovery::MIN_PACKET_SIZE,
        Constraint::DiscoveryProtocolVersion(version) => *version == crate::discovery::PROTOCOL_VERSION,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Integrity only, plus the transport constraints
    #[derive(Debug)]
    struct IntegrityOnly;

    impl ConstraintChecker for IntegrityOnly {
        fn format_name(&self) -> &str {
            "test.integrity"
        }

        fn supports(&self, constraint: &Constraint) -> bool {
            matches!(constraint, Constraint::Integrity(true)) || supports_transport(constraint)
        }
    }

    #[test]
    fn test_incoherent_requirements_rejected() {
        let result = InvocationConstraints::requiring([
            Constraint::Integrity(true),
            Constraint::Integrity(false),
        ]);
        assert!(matches!(result, Err(Error::IncoherentConstraints(_))));
    }

    #[test]
    fn test_required_wins_over_preferred() {
        let constraints = InvocationConstraints::new(
            [Constraint::Integrity(true)],
            [Constraint::Integrity(true), Constraint::Confidentiality(true)],
        )
        .unwrap();
        assert_eq!(constraints.requirements().len(), 1);
        assert_eq!(
            constraints.preferences().iter().collect::<Vec<_>>(),
            vec![&Constraint::Confidentiality(true)]
        );
    }

    #[test]
    fn test_order_independent_equality() {
        let a = InvocationConstraints::requiring([
            Constraint::Integrity(true),
            Constraint::UnicastSocketTimeout(10),
        ])
        .unwrap();
        let b = InvocationConstraints::requiring([
            Constraint::UnicastSocketTimeout(10),
            Constraint::Integrity(true),
        ])
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsupported_requirement_fails() {
        let constraints = InvocationConstraints::requiring([Constraint::Confidentiality(true)]).unwrap();
        match IntegrityOnly.check_constraints(&constraints) {
            Err(Error::UnsupportedConstraint { constraint, format }) => {
                assert_eq!(constraint, Constraint::Confidentiality(true));
                assert_eq!(format, "test.integrity");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_preference_dropped() {
        let constraints = InvocationConstraints::new(
            [Constraint::Integrity(true)],
            [Constraint::Confidentiality(true), Constraint::UnicastSocketTimeout(500)],
        )
        .unwrap();
        let satisfied = IntegrityOnly.check_constraints(&constraints).unwrap();

        assert_eq!(satisfied.requirements(), constraints.requirements());
        assert!(satisfied.preferences().contains(&Constraint::UnicastSocketTimeout(500)));
        assert!(!satisfied.preferences().contains(&Constraint::Confidentiality(true)));
    }

    #[test]
    fn test_alternatives_narrowed() {
        let constraints = InvocationConstraints::requiring([Constraint::Alternatives(vec![
            Constraint::Confidentiality(true),
            Constraint::Integrity(true),
        ])])
        .unwrap();
        let satisfied = IntegrityOnly.check_constraints(&constraints).unwrap();
        assert!(satisfied.requires(&Constraint::Integrity(true)));

        let hopeless = InvocationConstraints::requiring([Constraint::Alternatives(vec![
            Constraint::Confidentiality(true),
            Constraint::Delegation(true),
        ])])
        .unwrap();
        assert!(IntegrityOnly.check_constraints(&hopeless).is_err());
    }

    #[test]
    fn test_make_absolute_and_deadline() {
        let constraints = InvocationConstraints::new(
            [Constraint::ConnectionRelativeTime(5_000)],
            [Constraint::ConnectionAbsoluteTime(9_000)],
        )
        .unwrap();

        assert_eq!(constraints.connection_deadline(1_000), Some(6_000));
        assert_eq!(constraints.connection_deadline(7_000), Some(9_000));

        let absolute = constraints.make_absolute(1_000);
        assert!(absolute.requires(&Constraint::ConnectionAbsoluteTime(6_000)));
        // Anchored once; later starts no longer move the deadline
        assert_eq!(absolute.connection_deadline(3_000), Some(6_000));
    }

    #[test]
    fn test_combine_detects_conflict() {
        let a = InvocationConstraints::requiring([Constraint::ClientAuthentication(true)]).unwrap();
        let b = InvocationConstraints::requiring([Constraint::ClientAuthentication(false)]).unwrap();
        assert!(a.combine(&b).is_err());

        let c = InvocationConstraints::new([], [Constraint::MulticastMaxPacketSize(1024)]).unwrap();
        let combined = a.combine(&c).unwrap();
        assert_eq!(combined.max_packet_size(), Some(1024));
    }

    #[test]
    fn test_json_round_trip_validates() {
        let json = r#"{"requirements":[{"Integrity":true},{"UnicastSocketTimeout":250}]}"#;
        let constraints: InvocationConstraints = serde_json::from_str(json).unwrap();
        assert_eq!(constraints.socket_timeout(), Some(Duration::from_millis(250)));

        let bad = r#"{"requirements":[{"Delegation":true},{"Delegation":false}]}"#;
        assert!(serde_json::from_str::<InvocationConstraints>(bad).is_err());
    }

    #[test]
    fn test_narrowed_disjunctions_that_contradict() {
        #[derive(Debug)]
        struct EitherAuth;

        impl ConstraintChecker for EitherAuth {
            fn format_name(&self) -> &str {
                "test.either"
            }

            fn supports(&self, constraint: &Constraint) -> bool {
                matches!(constraint, Constraint::ClientAuthentication(_))
            }
        }

        let constraints = InvocationConstraints::requiring([
            Constraint::Alternatives(vec![
                Constraint::ClientAuthentication(true),
                Constraint::Integrity(false),
            ]),
            Constraint::Alternatives(vec![
                Constraint::ClientAuthentication(false),
                Constraint::Integrity(false),
            ]),
        ])
        .unwrap();
        assert!(matches!(
            EitherAuth.check_constraints(&constraints),
            Err(Error::UnsupportedConstraint { .. })
        ));
    }
}
