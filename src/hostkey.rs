//! Host-key verification decision logic (§4.6). Grounded on PuTTY's
//! `verify_ssh_host_key` (the manual-list check, then persistent-store
//! arbitration, then the non-interactive SW_ABORT override), re-shaped as a
//! pure function over a `HostKeyCache` trait rather than a global handle,
//! per §9's design note on eliminating process-wide mutable state.

use base64::encode as base64_encode;
use tracing::info;

use crate::config::ManualHostKey;
use crate::error::SeatPromptResult;

/// Outcome of consulting the persistent host-key cache (§4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    Match,
    Absent,
    Mismatch,
    /// A mismatch where the presented key is a certificate whose CA is
    /// configured as trusted: prompted with certificate-specific wording.
    MismatchCertTrustedCa,
}

/// The presented host key, as the BPP/transport layer below would hand it
/// up (out of scope per §1, so this is the boundary shape).
pub struct PresentedHostKey<'a> {
    pub host: &'a str,
    pub port: u16,
    pub keytype: &'a str,
    pub keystring: &'a [u8],
    pub sha256_fingerprint: &'a str,
    pub md5_fingerprint: &'a str,
    pub raw_public_blob: Option<&'a [u8]>,
}

/// The persistent store keyed by `(host, port, keytype)` (§4.6 step 2).
/// A trait rather than a concrete type so tests can supply an in-memory
/// fake instead of touching real persistent storage.
pub trait HostKeyCache {
    fn verdict(&self, host: &str, port: u16, keytype: &str, keystring: &[u8]) -> CacheVerdict;
    fn store(&mut self, host: &str, port: u16, keytype: &str, keystring: &[u8]);
}

/// Ask the user/operator to confirm a host-key decision (§4.6). Returns
/// `true` on "yes, trust it". Abstracted exactly like `HostKeyCache`: in a
/// real deployment this drives an interactive prompt, in tests a canned
/// answer.
pub trait HostKeyPrompt {
    fn confirm_absent(&mut self, key: &PresentedHostKey<'_>) -> bool;
    fn confirm_mismatch(&mut self, key: &PresentedHostKey<'_>) -> bool;
    fn confirm_mismatch_cert(&mut self, key: &PresentedHostKey<'_>) -> bool;
}

fn strip_alg_bits_prefix(fingerprint: &str) -> &str {
    match fingerprint.find(' ') {
        Some(first) => match fingerprint[first + 1..].find(' ') {
            Some(second) => &fingerprint[first + 1 + second + 1..],
            None => fingerprint,
        },
        None => fingerprint,
    }
}

fn manual_list_matches(manual: &[ManualHostKey], key: &PresentedHostKey<'_>) -> bool {
    let stripped_sha256 = strip_alg_bits_prefix(key.sha256_fingerprint);
    let stripped_md5 = strip_alg_bits_prefix(key.md5_fingerprint);
    manual.iter().any(|m| {
        let fp_match = m
            .fingerprint
            .as_deref()
            .map(|f| f == stripped_sha256 || f == stripped_md5)
            .unwrap_or(false);
        let blob_match = match (&m.base64_blob, key.raw_public_blob) {
            (Some(expected), Some(blob)) => *expected == base64_encode(blob),
            _ => false,
        };
        fp_match || blob_match
    })
}

/// The full decision procedure (§4.6). `non_interactive` standing in for
/// "running non-interactively": any prompt path becomes `SwAbort`.
pub fn decide(
    manual: &[ManualHostKey],
    cache: &mut dyn HostKeyCache,
    prompt: &mut dyn HostKeyPrompt,
    non_interactive: bool,
    key: &PresentedHostKey<'_>,
) -> SeatPromptResult {
    if !manual.is_empty() {
        return if manual_list_matches(manual, key) {
            SeatPromptResult::Ok
        } else {
            SeatPromptResult::SwAbort("not in manually configured list".into())
        };
    }

    match cache.verdict(key.host, key.port, key.keytype, key.keystring) {
        CacheVerdict::Match => SeatPromptResult::Ok,
        CacheVerdict::Absent => {
            if non_interactive {
                return SeatPromptResult::SwAbort("host key not cached and running non-interactively".into());
            }
            if prompt.confirm_absent(key) {
                info!(host = key.host, port = key.port, "caching new host key after user confirmation");
                cache.store(key.host, key.port, key.keytype, key.keystring);
                SeatPromptResult::Ok
            } else {
                SeatPromptResult::UserAbort
            }
        }
        CacheVerdict::Mismatch => {
            if non_interactive {
                return SeatPromptResult::SwAbort("host key mismatch and running non-interactively".into());
            }
            if prompt.confirm_mismatch(key) {
                info!(host = key.host, port = key.port, "overwriting cached host key after user confirmation");
                cache.store(key.host, key.port, key.keytype, key.keystring);
                SeatPromptResult::Ok
            } else {
                SeatPromptResult::UserAbort
            }
        }
        CacheVerdict::MismatchCertTrustedCa => {
            if non_interactive {
                return SeatPromptResult::SwAbort("certificate host key mismatch and running non-interactively".into());
            }
            if prompt.confirm_mismatch_cert(key) {
                SeatPromptResult::Ok
            } else {
                SeatPromptResult::UserAbort
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeCache(HashMap<(String, u16, String), CacheVerdict>);
    impl HostKeyCache for FakeCache {
        fn verdict(&self, host: &str, port: u16, keytype: &str, _keystring: &[u8]) -> CacheVerdict {
            self.0.get(&(host.to_string(), port, keytype.to_string())).copied().unwrap_or(CacheVerdict::Absent)
        }
        fn store(&mut self, host: &str, port: u16, keytype: &str, _keystring: &[u8]) {
            self.0.insert((host.to_string(), port, keytype.to_string()), CacheVerdict::Match);
        }
    }

    struct AlwaysYes;
    impl HostKeyPrompt for AlwaysYes {
        fn confirm_absent(&mut self, _key: &PresentedHostKey<'_>) -> bool {
            true
        }
        fn confirm_mismatch(&mut self, _key: &PresentedHostKey<'_>) -> bool {
            true
        }
        fn confirm_mismatch_cert(&mut self, _key: &PresentedHostKey<'_>) -> bool {
            true
        }
    }

    fn sample_key() -> PresentedHostKey<'static> {
        PresentedHostKey {
            host: "example.com",
            port: 22,
            keytype: "ssh-ed25519",
            keystring: b"keydata",
            sha256_fingerprint: "ssh-ed25519 256 SHA256:abc123",
            md5_fingerprint: "ssh-ed25519 256 MD5:de:ad:be:ef",
            raw_public_blob: None,
        }
    }

    #[test]
    fn manual_list_match_wins_outright() {
        let manual = vec![ManualHostKey { fingerprint: Some("SHA256:abc123".into()), base64_blob: None }];
        let mut cache = FakeCache(HashMap::new());
        let mut prompt = AlwaysYes;
        let verdict = decide(&manual, &mut cache, &mut prompt, true, &sample_key());
        assert_eq!(verdict, SeatPromptResult::Ok);
    }

    #[test]
    fn manual_list_miss_is_sw_abort_even_if_nothing_else_checked() {
        let manual = vec![ManualHostKey { fingerprint: Some("SHA256:different".into()), base64_blob: None }];
        let mut cache = FakeCache(HashMap::new());
        let mut prompt = AlwaysYes;
        let verdict = decide(&manual, &mut cache, &mut prompt, false, &sample_key());
        assert_eq!(verdict, SeatPromptResult::SwAbort("not in manually configured list".into()));
    }

    #[test]
    fn cached_mismatch_in_batch_mode_is_sw_abort() {
        let mut map = HashMap::new();
        map.insert(("example.com".to_string(), 22, "ssh-ed25519".to_string()), CacheVerdict::Mismatch);
        let mut cache = FakeCache(map);
        let mut prompt = AlwaysYes;
        let verdict = decide(&[], &mut cache, &mut prompt, true, &sample_key());
        assert!(matches!(verdict, SeatPromptResult::SwAbort(_)));
    }

    #[test]
    fn cached_match_is_ok_without_prompting() {
        let mut map = HashMap::new();
        map.insert(("example.com".to_string(), 22, "ssh-ed25519".to_string()), CacheVerdict::Match);
        let mut cache = FakeCache(map);
        struct NeverPrompt;
        impl HostKeyPrompt for NeverPrompt {
            fn confirm_absent(&mut self, _key: &PresentedHostKey<'_>) -> bool {
                panic!("should not prompt")
            }
            fn confirm_mismatch(&mut self, _key: &PresentedHostKey<'_>) -> bool {
                panic!("should not prompt")
            }
            fn confirm_mismatch_cert(&mut self, _key: &PresentedHostKey<'_>) -> bool {
                panic!("should not prompt")
            }
        }
        let mut prompt = NeverPrompt;
        let verdict = decide(&[], &mut cache, &mut prompt, false, &sample_key());
        assert_eq!(verdict, SeatPromptResult::Ok);
    }

    #[test]
    fn confirmed_absent_key_is_stored_in_cache() {
        let mut cache = FakeCache(HashMap::new());
        let mut prompt = AlwaysYes;
        let verdict = decide(&[], &mut cache, &mut prompt, false, &sample_key());
        assert_eq!(verdict, SeatPromptResult::Ok);
        assert_eq!(cache.verdict("example.com", 22, "ssh-ed25519", b"keydata"), CacheVerdict::Match);
    }

    #[test]
    fn confirmed_mismatch_overwrites_cache_entry() {
        let mut map = HashMap::new();
        map.insert(("example.com".to_string(), 22, "ssh-ed25519".to_string()), CacheVerdict::Mismatch);
        let mut cache = FakeCache(map);
        let mut prompt = AlwaysYes;
        let verdict = decide(&[], &mut cache, &mut prompt, false, &sample_key());
        assert_eq!(verdict, SeatPromptResult::Ok);
        assert_eq!(cache.verdict("example.com", 22, "ssh-ed25519", b"keydata"), CacheVerdict::Match);
    }
}
