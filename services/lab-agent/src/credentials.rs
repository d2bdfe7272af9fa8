//! Login credentials for tenant environments.
//!
//! Secrets are generated once and persisted in the roster; a record that
//! already carries a secret is never touched.

use lab_roster::{Roster, TenantId};
use rand::Rng;
use tracing::debug;

/// Supplies new secrets.
pub trait CredentialSource: Send + Sync {
    /// Produce one fresh secret.
    fn generate(&self) -> String;
}

/// Short lowercase words, easy to read out loud in a classroom.
const WORDS: &[&str] = &[
    "amber", "anchor", "aspen", "badger", "basil", "beacon", "birch", "bison", "cactus", "canyon",
    "cedar", "cobalt", "comet", "coral", "cricket", "delta", "ember", "falcon", "fern", "fjord",
    "garnet", "glacier", "granite", "harbor", "hazel", "heron", "indigo", "island", "jasper",
    "juniper", "kestrel", "lagoon", "lantern", "lemon", "lynx", "maple", "marble", "meadow",
    "nectar", "nimbus", "oasis", "onyx", "orchid", "otter", "pebble", "pepper", "pine", "quartz",
    "raven", "ridge", "river", "saffron", "sierra", "spruce", "summit", "thistle", "tiger",
    "tundra", "umber", "valley", "velvet", "walnut", "willow", "yarrow", "zephyr",
];

/// Secrets of the form `word-word-NNNN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCredentials;

impl CredentialSource for WordCredentials {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        let first = WORDS[rng.random_range(0..WORDS.len())];
        let second = WORDS[rng.random_range(0..WORDS.len())];
        let digits: u16 = rng.random_range(0..10_000);
        format!("{}-{}-{:04}", first, second, digits)
    }
}

/// Give every record without a secret a fresh one.
///
/// Returns the tenants that received a secret, in roster order.
pub fn issue_missing(roster: &mut Roster, source: &dyn CredentialSource) -> Vec<TenantId> {
    let mut issued = Vec::new();
    for record in roster.records_mut() {
        if record.secret.is_none() {
            record.secret = Some(source.generate());
            debug!(tenant_id = %record.tenant_id, "Issued credential");
            issued.push(record.tenant_id.clone());
        }
    }
    issued
}
