// Protocol numbers: {TYPE_PREFIX}-{year}-{4-digit sequence}

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::AuditEntry;
use crate::error::{StoreError, WorkflowError, WorkflowResult};
use crate::protocol::types::{OrgUnitId, Protocol, ProtocolType};
use crate::store::ProtocolStore;

static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z]{2,8})-(\d{4})-(\d{4,})$").expect("protocol number pattern is valid")
});

/// Human-readable protocol identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolNumber {
    prefix: String,
    year: i32,
    sequence: u32,
}

impl ProtocolNumber {
    pub fn new(protocol_type: ProtocolType, year: i32, sequence: u32) -> Self {
        Self {
            prefix: protocol_type.prefix().to_string(),
            year,
            sequence,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn protocol_type(&self) -> Option<ProtocolType> {
        ProtocolType::from_prefix(&self.prefix)
    }
}

impl fmt::Display for ProtocolNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:04}", self.prefix, self.year, self.sequence)
    }
}

impl FromStr for ProtocolNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = NUMBER_PATTERN
            .captures(s.trim())
            .ok_or_else(|| format!("'{s}' is not a protocol number (expected PREFIX-YYYY-NNNN)"))?;
        let year = caps[2].parse::<i32>().map_err(|e| e.to_string())?;
        let sequence = caps[3].parse::<u32>().map_err(|e| e.to_string())?;
        if sequence == 0 {
            return Err(format!("'{s}' has a zero sequence"));
        }
        Ok(Self {
            prefix: caps[1].to_string(),
            year,
            sequence,
        })
    }
}

impl TryFrom<String> for ProtocolNumber {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolNumber> for String {
    fn from(number: ProtocolNumber) -> Self {
        number.to_string()
    }
}

/// Sequence for the next protocol given how many already exist for the same
/// org-unit, type and year
pub fn next_sequence(existing: u32) -> u32 {
    existing.saturating_add(1)
}

/// Retry behaviour when two allocations race for the same number
#[derive(Debug, Clone)]
pub struct NumberingPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for NumberingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            jitter: true,
        }
    }
}

impl NumberingPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
        } else {
            delay
        }
    }
}

/// Allocates protocol numbers by relying on the store's uniqueness check
/// instead of a read-then-write counter.
#[derive(Debug, Clone, Default)]
pub struct NumberAllocator {
    policy: NumberingPolicy,
}

impl NumberAllocator {
    pub fn new(policy: NumberingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &NumberingPolicy {
        &self.policy
    }

    /// Insert a new protocol under the next free number.
    ///
    /// `build` is called once per attempt with the candidate number and must
    /// return the protocol and the audit entries to insert alongside it.
    pub async fn allocate_and_insert<S, F>(
        &self,
        store: &S,
        org_unit: OrgUnitId,
        protocol_type: ProtocolType,
        year: i32,
        mut build: F,
    ) -> WorkflowResult<Protocol>
    where
        S: ProtocolStore + ?Sized,
        F: FnMut(ProtocolNumber) -> (Protocol, Vec<AuditEntry>),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        let mut floor = 0u32;

        loop {
            let existing = store.count_protocols(org_unit, protocol_type, year).await?;
            let sequence = next_sequence(existing).max(floor);
            let number = ProtocolNumber::new(protocol_type, year, sequence);
            let (protocol, entries) = build(number.clone());

            match store.insert_protocol(&protocol, &entries).await {
                Ok(()) => {
                    debug!(protocol.number = %number, attempt, "Protocol number allocated");
                    return Ok(protocol);
                }
                Err(StoreError::DuplicateNumber(_)) => {
                    floor = sequence.saturating_add(1);
                    attempt += 1;
                    warn!(
                        protocol.number = %number,
                        attempt,
                        max_attempts,
                        "Protocol number already taken, retrying allocation"
                    );
                    if attempt >= max_attempts {
                        return Err(WorkflowError::DuplicateProtocolNumber {
                            number: number.to_string(),
                            attempts: max_attempts,
                        });
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                }
                Err(e) => return Err(WorkflowError::Storage(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pads_sequence_to_four_digits() {
        let number = ProtocolNumber::new(ProtocolType::LeaveOfAbsence, 2025, next_sequence(3));
        assert_eq!(number.to_string(), "AFST-2025-0004");
    }

    #[test]
    fn test_sequences_beyond_four_digits_are_not_truncated() {
        let number = ProtocolNumber::new(ProtocolType::Initiation, 2024, 12345);
        assert_eq!(number.to_string(), "INIC-2024-12345");
    }

    #[test]
    fn test_parse_protocol_number() {
        let number: ProtocolNumber = "MAIO-2023-0042".parse().unwrap();
        assert_eq!(number.prefix(), "MAIO");
        assert_eq!(number.year(), 2023);
        assert_eq!(number.sequence(), 42);
        assert_eq!(number.protocol_type(), Some(ProtocolType::ComingOfAge));
    }

    #[test]
    fn test_parse_rejects_malformed_numbers() {
        assert!("AFST-25-0001".parse::<ProtocolNumber>().is_err());
        assert!("afst-2025-0001".parse::<ProtocolNumber>().is_err());
        assert!("AFST-2025-001".parse::<ProtocolNumber>().is_err());
        assert!("AFST-2025-0000".parse::<ProtocolNumber>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let number = ProtocolNumber::new(ProtocolType::Honors, 2025, 7);
        let json = serde_json::to_string(&number).unwrap();
        assert_eq!(json, "\"HONR-2025-0007\"");
        let back: ProtocolNumber = serde_json::from_str(&json).unwrap();
        assert_eq!(back, number);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = NumberingPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
    }
}
