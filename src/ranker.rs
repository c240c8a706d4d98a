use crate::probe_result::ProbeResult;

/// Order results fastest first. Unreachable results keep their input order
/// at the end, as do equal latencies.
pub fn rank(mut results: Vec<ProbeResult>) -> Vec<ProbeResult> {
    // reachable by ascending latency, then every unreachable one
    results.sort_by_key(|r| (r.latency_ms < 0, r.latency_ms.max(0)));
    results
}
