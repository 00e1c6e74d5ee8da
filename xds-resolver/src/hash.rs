//! Request-hash generation for consistent-hash load balancing.

use xxhash_rust::xxh64::xxh64;

use crate::client::RpcInfo;
use crate::matcher;
use crate::resource::{HashPolicy, HashPolicyKind};

/// Filter-state key recognized as the channel id.
const CHANNEL_ID_KEY: &str = "io.grpc.channel_id";

/// Evaluates the route's hash policies for one RPC.
///
/// Policies run in declared order; each either produces a 64-bit value or
/// skips. Values fold into `hash * 31 + value`, and evaluation stops after
/// the first terminal policy that produced one. When nothing produced a
/// value a fresh random hash is drawn so the consistent-hash balancer still
/// spreads load.
pub(crate) fn generate_hash(
    policies: &[HashPolicy],
    rpc: &RpcInfo<'_>,
    channel_id: u64,
) -> u64 {
    let mut hash: u64 = 0;
    let mut generated = false;
    for policy in policies {
        let value = match &policy.kind {
            HashPolicyKind::Header {
                header_name,
                regex,
                regex_substitution,
            } => matcher::header_value(rpc, header_name).map(|value| {
                let value = match regex {
                    Some(re) => re.replace_all(&value, regex_substitution.as_str()).into_owned(),
                    None => value,
                };
                xxh64(value.as_bytes(), 0)
            }),
            HashPolicyKind::ChannelId => Some(channel_id),
            HashPolicyKind::FilterState { key } if key == CHANNEL_ID_KEY => Some(channel_id),
            HashPolicyKind::FilterState { .. } => None,
        };
        if let Some(value) = value {
            hash = hash.wrapping_mul(31).wrapping_add(value);
            generated = true;
            if policy.terminal {
                break;
            }
        }
    }
    if !generated {
        use rand::Rng as _;
        return rand::thread_rng().gen();
    }
    hash
}
