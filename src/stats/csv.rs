use crate::stats::{ReportStats, TrendReport};

fn push_trend(out: &mut String, name: &str, t: &TrendReport) {
    out.push_str(&format!("{}_count,counter,{}\n", name, t.count));
    out.push_str(&format!("{}_avg,gauge,{:.3}\n", name, t.avg));
    out.push_str(&format!("{}_min,gauge,{:.3}\n", name, t.min));
    out.push_str(&format!("{}_med,gauge,{:.3}\n", name, t.med));
    out.push_str(&format!("{}_max,gauge,{:.3}\n", name, t.max));
    out.push_str(&format!("{}_p90,gauge,{:.3}\n", name, t.p90));
    out.push_str(&format!("{}_p95,gauge,{:.3}\n", name, t.p95));
    out.push_str(&format!("{}_p99,gauge,{:.3}\n", name, t.p99));
}

fn safe_name(name: &str) -> String {
    name.replace([' ', ':', ',', '/'], "_")
}

/// Generate CSV output from ReportStats
pub fn generate_csv(report: &ReportStats) -> String {
    let mut out = String::from("metric_name,metric_type,value\n");

    out.push_str(&format!("http_reqs,counter,{}\n", report.total_requests));
    out.push_str(&format!(
        "http_req_failed,rate,{:.4}\n",
        report.http_req_failed_rate
    ));
    push_trend(&mut out, "http_req_duration", &report.http_req_duration);

    for (code, count) in &report.status_codes {
        out.push_str(&format!("http_req_status_{},counter,{}\n", code, count));
    }

    out.push_str(&format!("iterations,counter,{}\n", report.iterations));
    out.push_str(&format!(
        "iteration_errors,counter,{}\n",
        report.iteration_errors
    ));
    push_trend(&mut out, "iteration_duration", &report.iteration_duration);

    out.push_str(&format!("data_sent,counter,{}\n", report.total_data_sent));
    out.push_str(&format!(
        "data_received,counter,{}\n",
        report.total_data_received
    ));

    // Checks (tuple: total, passes)
    out.push_str(&format!("checks,rate,{:.4}\n", report.checks_rate));
    for (name, (total, passes)) in &report.checks {
        let name = safe_name(name);
        out.push_str(&format!("check_{}_passed,counter,{}\n", name, passes));
        out.push_str(&format!(
            "check_{}_failed,counter,{}\n",
            name,
            total - passes
        ));
    }

    for (name, trend) in &report.trends {
        push_trend(&mut out, &safe_name(name), trend);
    }
    for (name, value) in &report.counters {
        out.push_str(&format!("{},counter,{}\n", safe_name(name), value));
    }
    for (name, rate) in &report.rates {
        out.push_str(&format!("{},rate,{:.4}\n", safe_name(name), rate.rate));
    }
    for (name, value) in &report.gauges {
        out.push_str(&format!("{},gauge,{}\n", safe_name(name), value));
    }

    out
}
