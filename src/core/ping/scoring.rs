use super::{
    failure_weight::FailureWeightTracker,
    model::{ProbeMethod, ProbeResult, UNREACHABLE_RTT_MS},
};

/// 每个丢包百分点折算的毫秒数。
const LOSS_WEIGHT_MS: f64 = 30.0;
const FAST_RTT_THRESHOLD_MS: i64 = 50;

/// 探测方式的置信度惩罚（毫秒当量）。
pub fn probe_method_penalty(method: ProbeMethod) -> i64 {
    match method {
        ProbeMethod::Icmp => 0,
        ProbeMethod::Tls | ProbeMethod::Tcp443 => 100,
        ProbeMethod::Tcp80 => 300,
        ProbeMethod::Udp53 => 500,
        ProbeMethod::None => UNREACHABLE_RTT_MS,
        // 命中缓存时原探测方式的惩罚已并入 RTT
        ProbeMethod::Cached | ProbeMethod::Stale => 0,
    }
}

pub fn composite_score(result: &ProbeResult, weight: i64) -> i64 {
    let loss = (result.loss_percent * LOSS_WEIGHT_MS).round() as i64;
    result
        .rtt_ms
        .saturating_add(loss)
        .saturating_add(probe_method_penalty(result.probe_method))
        .saturating_add(weight)
}

/// 综合排序：得分升序，同分按 IP 字符串升序。
///
/// 所有得分在排序前用同一时刻一次性算出，比较函数因此是全序。
pub fn sort_results(
    results: Vec<ProbeResult>,
    tracker: &FailureWeightTracker,
    now_ms: i64,
) -> Vec<ProbeResult> {
    let mut scored: Vec<(i64, ProbeResult)> = results
        .into_iter()
        .map(|result| {
            let weight = tracker.weight_at(&result.ip, now_ms);
            (composite_score(&result, weight), result)
        })
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| a.ip.cmp(&b.ip)));
    scored.into_iter().map(|(_, result)| result).collect()
}

/// 按探测质量调整缓存时长：不可达与高丢包缓存更短，低延迟缓存更长。
pub fn dynamic_ttl_ms(result: &ProbeResult, base_ttl_ms: i64) -> i64 {
    let base = base_ttl_ms as f64;
    let ttl = if result.loss_percent >= 100.0 || result.rtt_ms >= UNREACHABLE_RTT_MS {
        base * 0.08
    } else if result.loss_percent >= 50.0 {
        base * 0.17
    } else if result.loss_percent > 0.0 {
        base
    } else if result.rtt_ms < FAST_RTT_THRESHOLD_MS {
        base * 10.0
    } else {
        base * 5.0
    };
    ttl as i64
}
