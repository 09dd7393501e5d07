//! Rule set to nginx configuration rendering
//!
//! `compile` is a pure function: it never touches the registry, the
//! filesystem or the container runtime. The output is a complete
//! standalone nginx configuration so the proxy's own `-t` test can
//! validate a staging file in isolation.
//!
//! Rendering is deterministic: rules are sorted by
//! (source_host, source_path, id) and header maps are rendered in key
//! order, so identical rule sets produce byte-identical text regardless
//! of registry iteration order.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::CompileError;
use crate::rule::{LoadBalancing, Protocol, ProxyRule};

/// Render the enabled rules into nginx configuration text
pub fn compile(rules: &[ProxyRule]) -> Result<String, CompileError> {
    let mut enabled: Vec<&ProxyRule> = rules.iter().filter(|r| r.enabled).collect();
    enabled.sort_by(|a, b| {
        (&a.source_host, &a.source_path, &a.id).cmp(&(&b.source_host, &b.source_path, &b.id))
    });

    for rule in &enabled {
        if let Some(lb) = &rule.load_balancing {
            if lb.targets.is_empty() {
                return Err(CompileError::EmptyUpstream {
                    rule_id: rule.id.clone(),
                });
            }
        }
        if rule.ssl_enabled && (rule.ssl_cert_path.is_none() || rule.ssl_key_path.is_none()) {
            return Err(CompileError::MissingCertificate {
                rule_id: rule.id.clone(),
            });
        }
    }

    let http_rules: Vec<&ProxyRule> = enabled
        .iter()
        .copied()
        .filter(|r| !r.protocol.is_stream())
        .collect();
    let stream_rules: Vec<&ProxyRule> = enabled
        .iter()
        .copied()
        .filter(|r| r.protocol.is_stream())
        .collect();

    let mut out = String::new();
    out.push_str("# Generated by rulegate. Do not edit; changes are overwritten on apply.\n\n");
    out.push_str("events {\n    worker_connections 1024;\n}\n");

    out.push_str("\nhttp {\n");
    render_http_preamble(&mut out, &http_rules);

    for rule in &http_rules {
        if needs_upstream(rule) {
            render_upstream(&mut out, rule);
        }
    }

    // One server block per host; locations within it in sorted rule order
    let mut by_host: BTreeMap<&str, Vec<&ProxyRule>> = BTreeMap::new();
    for rule in &http_rules {
        by_host.entry(&rule.source_host).or_default().push(rule);
    }

    for (host, host_rules) in &by_host {
        render_server(&mut out, host, host_rules);
    }

    out.push_str("}\n");

    if !stream_rules.is_empty() {
        out.push_str("\nstream {\n");
        for rule in &stream_rules {
            if needs_upstream(rule) {
                render_upstream(&mut out, rule);
            }
            render_stream_server(&mut out, rule);
        }
        out.push_str("}\n");
    }

    Ok(out)
}

/// Whether the rule needs a named upstream pool
///
/// Load balancing always does; a health check does too, because the
/// passive probe parameters live on upstream server lines.
fn needs_upstream(rule: &ProxyRule) -> bool {
    rule.load_balancing.is_some() || rule.health_check.is_some()
}

/// Deterministic nginx identifier for a rule
fn upstream_name(rule: &ProxyRule) -> String {
    format!("rulegate_{}", sanitize_ident(&rule.id))
}

fn sanitize_ident(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Zone declarations and cache paths live at http scope
fn render_http_preamble(out: &mut String, rules: &[&ProxyRule]) {
    for rule in rules {
        if let Some(advanced) = &rule.advanced {
            if let Some(rl) = &advanced.rate_limit {
                let _ = writeln!(
                    out,
                    "    limit_req_zone $binary_remote_addr zone={}:10m rate={}r/s;",
                    upstream_name(rule),
                    rl.requests_per_second
                );
            }
            if advanced.cache_enabled {
                let _ = writeln!(
                    out,
                    "    proxy_cache_path /var/cache/rulegate/{} levels=1:2 keys_zone={}_cache:10m max_size=100m inactive=60m;",
                    sanitize_ident(&rule.id),
                    upstream_name(rule)
                );
            }
        }
    }
}

fn render_upstream(out: &mut String, rule: &ProxyRule) {
    let _ = writeln!(out, "\n    upstream {} {{", upstream_name(rule));

    let probe_params = rule
        .health_check
        .as_ref()
        .map(|hc| format!(" max_fails={} fail_timeout={}s", hc.retries, hc.interval_secs))
        .unwrap_or_default();

    if let Some(hc) = &rule.health_check {
        let codes: Vec<String> = hc.success_codes.iter().map(|c| c.to_string()).collect();
        let _ = writeln!(
            out,
            "        # health probe: GET {} expect {} within {}s",
            hc.path,
            codes.join(","),
            hc.timeout_secs
        );
    }

    match &rule.load_balancing {
        Some(lb) => {
            render_balancing_method(out, lb);
            for target in &lb.targets {
                let weight = target
                    .weight
                    .filter(|w| *w > 1)
                    .map(|w| format!(" weight={}", w))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "        server {}:{}{}{};",
                    target.container, target.port, weight, probe_params
                );
            }
        }
        None => {
            let _ = writeln!(
                out,
                "        server {}:{}{};",
                rule.target_container, rule.target_port, probe_params
            );
        }
    }

    out.push_str("    }\n");
}

/// Session affinity pins clients by cookie and takes precedence over the
/// declared balancing method; otherwise the method directive is emitted
fn render_balancing_method(out: &mut String, lb: &LoadBalancing) {
    if lb.sticky_sessions {
        let cookie = lb.cookie_name.as_deref().unwrap_or("rulegate_sticky");
        let _ = writeln!(out, "        hash $cookie_{} consistent;", cookie);
    } else if let Some(directive) = lb.method.directive() {
        let _ = writeln!(out, "        {};", directive);
    }
}

fn render_server(out: &mut String, host: &str, rules: &[&ProxyRule]) {
    let _ = writeln!(out, "\n    server {{");
    out.push_str("        listen 80;\n");

    // The first rule in sorted order with SSL enabled provides the
    // certificate for the host
    if let Some(ssl_rule) = rules.iter().find(|r| r.ssl_enabled) {
        out.push_str("        listen 443 ssl;\n");
        let _ = writeln!(
            out,
            "        ssl_certificate {};",
            ssl_rule.ssl_cert_path.as_deref().unwrap_or_default()
        );
        let _ = writeln!(
            out,
            "        ssl_certificate_key {};",
            ssl_rule.ssl_key_path.as_deref().unwrap_or_default()
        );
    }

    let _ = writeln!(out, "        server_name {};", host);

    for rule in rules {
        render_location(out, rule);
    }

    out.push_str("    }\n");
}

fn render_location(out: &mut String, rule: &ProxyRule) {
    let _ = writeln!(out, "\n        location {} {{", rule.source_path);

    if let Some(advanced) = &rule.advanced {
        for rewrite in &advanced.rewrites {
            let flag = rewrite
                .flag
                .as_ref()
                .map(|f| format!(" {}", f))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "            rewrite {} {}{};",
                rewrite.pattern, rewrite.replacement, flag
            );
        }

        if let Some(rl) = &advanced.rate_limit {
            let burst = if rl.burst_size > 0 {
                format!(" burst={}", rl.burst_size)
            } else {
                String::new()
            };
            let nodelay = if rl.nodelay { " nodelay" } else { "" };
            let _ = writeln!(
                out,
                "            limit_req zone={}{}{};",
                upstream_name(rule),
                burst,
                nodelay
            );
        }

        if let Some(size) = &advanced.max_body_size {
            let _ = writeln!(out, "            client_max_body_size {};", size);
        }
        if let Some(secs) = advanced.connect_timeout_secs {
            let _ = writeln!(out, "            proxy_connect_timeout {}s;", secs);
        }
        if let Some(secs) = advanced.send_timeout_secs {
            let _ = writeln!(out, "            proxy_send_timeout {}s;", secs);
        }
        if let Some(secs) = advanced.read_timeout_secs {
            let _ = writeln!(out, "            proxy_read_timeout {}s;", secs);
        }
        if let Some(buffering) = advanced.buffering {
            let _ = writeln!(
                out,
                "            proxy_buffering {};",
                if buffering { "on" } else { "off" }
            );
        }
        if advanced.cache_enabled {
            let _ = writeln!(out, "            proxy_cache {}_cache;", upstream_name(rule));
            let _ = writeln!(
                out,
                "            proxy_cache_valid 200 302 {}s;",
                advanced.cache_valid_secs.unwrap_or(60)
            );
        }
        if advanced.cors_enabled {
            let origin = advanced.cors_allow_origin.as_deref().unwrap_or("*");
            let _ = writeln!(
                out,
                "            add_header Access-Control-Allow-Origin \"{}\" always;",
                origin
            );
            out.push_str("            add_header Access-Control-Allow-Methods \"GET, POST, PUT, PATCH, DELETE, OPTIONS\" always;\n");
            out.push_str("            add_header Access-Control-Allow-Headers \"Authorization, Content-Type\" always;\n");
        }
    }

    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("            proxy_set_header X-Forwarded-Proto $scheme;\n");

    // BTreeMap keeps header rendering order-independent of insertion
    for (name, value) in rule.request_headers.iter().collect::<BTreeMap<_, _>>() {
        let _ = writeln!(out, "            proxy_set_header {} \"{}\";", name, value);
    }
    for (name, value) in rule.response_headers.iter().collect::<BTreeMap<_, _>>() {
        let _ = writeln!(out, "            add_header {} \"{}\" always;", name, value);
    }

    let scheme = match rule.protocol {
        Protocol::Https => "https",
        _ => "http",
    };
    if needs_upstream(rule) {
        let _ = writeln!(out, "            proxy_pass {}://{};", scheme, upstream_name(rule));
    } else {
        let _ = writeln!(
            out,
            "            proxy_pass {}://{}:{};",
            scheme, rule.target_container, rule.target_port
        );
    }

    // Escape hatch: appended last, verbatim; only the proxy's own config
    // test validates it
    if let Some(custom) = &rule.custom_config {
        for line in custom.lines() {
            let _ = writeln!(out, "            {}", line);
        }
    }

    out.push_str("        }\n");
}

/// Stream rules forward the declared port verbatim: the proxy listens on
/// the rule's target port and forwards to the same port on the container
fn render_stream_server(out: &mut String, rule: &ProxyRule) {
    let _ = writeln!(out, "\n    server {{");
    let udp = if rule.protocol == Protocol::Udp { " udp" } else { "" };
    let _ = writeln!(out, "        listen {}{};", rule.target_port, udp);

    if needs_upstream(rule) {
        let _ = writeln!(out, "        proxy_pass {};", upstream_name(rule));
    } else {
        let _ = writeln!(
            out,
            "        proxy_pass {}:{};",
            rule.target_container, rule.target_port
        );
    }

    out.push_str("    }\n");
}
