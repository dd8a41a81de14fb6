use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use colored::Colorize;
use palisade::{
    adapters::{ProxyHandler, ProxyMode, RequestInterceptor, UpstreamClient},
    config::{AppConfig, AppConfigValidator, loader::load_config},
    core::analysis::{AnomalyDetector, AnomalyThresholds, EfficacyAnalyzer, RuleMetrics},
    core::waf::{RuleAction, RuleEngine, RuleSpec, shannon_entropy},
    events::{EventSink, SinkOptions},
    ports::http_client::HttpClient,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Inline HTTP reverse-proxy web application firewall")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WAF reverse proxy
    Run(RunArgs),
    /// Manage WAF rules
    Rules {
        #[clap(subcommand)]
        action: RulesAction,
    },
    /// Analyze a payload or an event log
    Analyze {
        #[clap(subcommand)]
        action: AnalyzeAction,
    },
    /// Rule efficacy metrics derived from event logs
    Efficacy {
        #[clap(subcommand)]
        action: EfficacyAction,
    },
    /// Traffic anomaly detection over event logs
    Anomaly {
        #[clap(subcommand)]
        action: AnomalyAction,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Target application URL to forward traffic to
    #[clap(long)]
    proxy_to: Option<String>,

    /// Local port to listen on
    #[clap(long)]
    port: Option<u16>,

    /// Enable dry-run mode (log but don't block)
    #[clap(long)]
    dry_run: bool,

    /// Enable interactive mode (approve/deny blocked requests)
    #[clap(long)]
    interactive: bool,

    /// Path to the newline-delimited JSON event log
    #[clap(long)]
    log_file: Option<String>,

    /// Configuration file (YAML, JSON or TOML)
    #[clap(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    /// List the active rule set
    List {
        /// Configuration file providing custom rules
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Validate and describe a new custom rule
    Add(RuleAddArgs),
}

#[derive(clap::Args, Debug)]
struct RuleAddArgs {
    #[clap(long)]
    id: u32,
    #[clap(long)]
    name: String,
    #[clap(long, default_value = "")]
    description: String,
    /// request_headers, request_uri or request_body
    #[clap(long, default_value = "request_body")]
    phase: String,
    /// contains, notcontains, startswith, endswith, equals, regex,
    /// notregex, high_entropy, sqli, xss
    #[clap(long, default_value = "contains")]
    operator: String,
    #[clap(long, default_value = "")]
    pattern: String,
    /// REQUEST_URI, REQUEST_HEADERS, REQUEST_HEADERS:<name>, ARGS or
    /// REQUEST_BODY
    #[clap(long, default_value = "REQUEST_BODY")]
    target: String,
    /// block, log or pass
    #[clap(long, default_value = "block")]
    action: String,
    /// low, medium, high or critical
    #[clap(long, default_value = "medium")]
    severity: String,
}

#[derive(Subcommand, Debug)]
enum AnalyzeAction {
    /// Analyze a single payload against the rule set
    Payload {
        /// The payload text to analyze
        payload: String,
    },
    /// Summarise an event log
    Log {
        /// Newline-delimited JSON event log
        #[clap(long)]
        log_file: String,
    },
}

#[derive(Subcommand, Debug)]
enum EfficacyAction {
    /// Generate a comprehensive rule efficacy report
    Report {
        #[clap(long)]
        log_file: String,
        /// text or json
        #[clap(long, default_value = "text")]
        format: String,
        /// Write the report to a file instead of stdout
        #[clap(long)]
        output: Option<String>,
    },
    /// Show the best rules by F1 score
    Top {
        #[clap(long)]
        log_file: String,
        #[clap(long, default_value_t = 10)]
        count: usize,
    },
    /// Show rules with high false positive rates
    Problematic {
        #[clap(long)]
        log_file: String,
    },
    /// Compare two rules side by side
    Compare {
        rule_id_1: String,
        rule_id_2: String,
        #[clap(long)]
        log_file: String,
    },
}

#[derive(Subcommand, Debug)]
enum AnomalyAction {
    /// List anomalies detected in an event log
    Report {
        #[clap(long)]
        log_file: String,
        /// Configuration file providing detection thresholds
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Show aggregate traffic statistics for an event log
    Stats {
        #[clap(long)]
        log_file: String,
        #[clap(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run_command(run_args).await,
        Commands::Rules { action } => match action {
            RulesAction::List { config } => rules_list(config.as_deref()),
            RulesAction::Add(add_args) => rules_add(add_args),
        },
        Commands::Analyze { action } => {
            tracing_setup::init_console_tracing()?;
            match action {
                AnalyzeAction::Payload { payload } => analyze_payload(&payload),
                AnalyzeAction::Log { log_file } => analyze_log(&log_file),
            }
        }
        Commands::Efficacy { action } => {
            tracing_setup::init_console_tracing()?;
            match action {
                EfficacyAction::Report {
                    log_file,
                    format,
                    output,
                } => efficacy_report(&log_file, &format, output.as_deref()),
                EfficacyAction::Top { log_file, count } => efficacy_top(&log_file, count),
                EfficacyAction::Problematic { log_file } => efficacy_problematic(&log_file),
                EfficacyAction::Compare {
                    rule_id_1,
                    rule_id_2,
                    log_file,
                } => efficacy_compare(&log_file, &rule_id_1, &rule_id_2),
            }
        }
        Commands::Anomaly { action } => {
            tracing_setup::init_console_tracing()?;
            match action {
                AnomalyAction::Report { log_file, config } => {
                    anomaly_report(&log_file, config.as_deref())
                }
                AnomalyAction::Stats { log_file, config } => {
                    anomaly_stats(&log_file, config.as_deref())
                }
            }
        }
    }
}

/// Resolve the effective configuration: file values first, flags on top.
fn resolve_config(args: &RunArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    if let Some(proxy_to) = &args.proxy_to {
        config.proxy_to = proxy_to.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.interactive {
        config.interactive = true;
    }
    if let Some(log_file) = &args.log_file {
        config.events.json_path = Some(log_file.clone());
    }

    Ok(config)
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;

    if let Err(e) = AppConfigValidator::validate(&config) {
        bail!("invalid configuration:\n{e}");
    }

    tracing_setup::init_tracing()?;

    let mode = ProxyMode::from_flags(config.dry_run, config.interactive);
    let timeout = Duration::from_secs(config.timeout_secs);

    let mut engine = RuleEngine::with_default_rules();
    for spec in config.rules.clone() {
        let id = spec.id;
        if let Err(e) = engine.add_spec(spec) {
            tracing::warn!(rule_id = id, error = %e, "rejected custom rule");
        }
    }
    tracing::info!(rules = engine.rules().len(), "rule set loaded");

    let sink = Arc::new(
        EventSink::new(SinkOptions {
            json_path: config.events.json_path.clone().map(PathBuf::from),
            csv_path: config.events.csv_path.clone().map(PathBuf::from),
            max_events: config.events.max_events,
            stdout: config.events.stdout,
        })
        .context("failed to open event sinks")?,
    );

    let http_client: Arc<dyn HttpClient> =
        Arc::new(UpstreamClient::new(timeout).context("failed to create upstream client")?);

    let handler = Arc::new(ProxyHandler::new(
        Arc::new(engine),
        http_client,
        sink,
        RequestInterceptor::new(config.max_body_bytes, timeout),
        config.proxy_to.clone(),
        mode,
    ));

    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    use axum::{
        Router,
        body::Body,
        extract::{ConnectInfo, Request},
        response::Response,
        routing::any,
    };
    use std::convert::Infallible;

    let make_request_route = |handler: Arc<ProxyHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    match handler.handle_request(req, Some(client_addr)).await {
                        Ok(response) => Ok::<Response<Body>, Infallible>(response),
                        Err(e) => {
                            tracing::error!("Request handling error: {:?}", e);
                            let error_response = Response::builder()
                                .status(500)
                                .body(Body::from("Internal Server Error"))
                                .unwrap_or_else(|_| {
                                    Response::new(Body::from("Internal Server Error"))
                                });
                            Ok(error_response)
                        }
                    }
                }
            },
        )
    };

    let app = Router::new()
        .route("/{*path}", make_request_route(handler.clone()))
        .route("/", make_request_route(handler));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        listen = %addr,
        origin = %config.proxy_to,
        mode = mode.as_str(),
        "Palisade WAF starting"
    );
    println!("Palisade WAF listening on {addr} (mode: {})", mode.as_str());
    println!("Forwarding to: {}", config.proxy_to);
    if config.dry_run {
        println!("{}", "Running in DRY-RUN mode (no blocking)".yellow());
    }
    if config.interactive {
        println!("Running in INTERACTIVE mode");
    }
    println!("Press Ctrl+C to stop");

    let shutdown_for_serve = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_for_serve.wait_for_shutdown_signal().await;
    })
    .await
    .context("Server error")?;

    tracing::info!("Palisade WAF stopped");
    Ok(())
}

fn rules_list(config_path: Option<&str>) -> Result<()> {
    let mut engine = RuleEngine::with_default_rules();

    if let Some(path) = config_path {
        let config = load_config(path)?;
        for spec in config.rules {
            let id = spec.id;
            if let Err(e) = engine.add_spec(spec) {
                eprintln!("warning: rejected rule {id}: {e}");
            }
        }
    }

    println!("{}", "Active WAF rules".bold());
    for rule in engine.rules() {
        let severity = match rule.severity.as_str() {
            "critical" => rule.severity.as_str().bright_red(),
            "high" => rule.severity.as_str().red(),
            "medium" => rule.severity.as_str().yellow(),
            _ => rule.severity.as_str().cyan(),
        };
        println!(
            "  {:>5}  {:<32}  {:<16} {:<10} {:<18} {:<6} {}",
            rule.id,
            rule.name,
            rule.phase.as_str(),
            rule.operator.name(),
            rule.target,
            rule.action.as_str(),
            severity,
        );
    }
    println!("{} rules", engine.rules().len());
    Ok(())
}

fn rules_add(args: RuleAddArgs) -> Result<()> {
    let spec = RuleSpec {
        id: args.id,
        name: args.name,
        description: args.description,
        phase: serde_json::from_value(serde_json::Value::String(args.phase.clone()))
            .map_err(|_| color_eyre::eyre::eyre!("unknown phase '{}'", args.phase))?,
        operator: args.operator,
        pattern: args.pattern,
        target: args.target,
        action: serde_json::from_value(serde_json::Value::String(args.action.clone()))
            .map_err(|_| color_eyre::eyre::eyre!("unknown action '{}'", args.action))?,
        severity: serde_json::from_value(serde_json::Value::String(args.severity.clone()))
            .map_err(|_| color_eyre::eyre::eyre!("unknown severity '{}'", args.severity))?,
        enabled: true,
    };

    let rule = spec
        .clone()
        .compile()
        .map_err(|e| color_eyre::eyre::eyre!("rule rejected: {e}"))?;

    println!("{}", "Rule compiled successfully".green());
    println!(
        "  {} {} ({} / {} on {})",
        rule.id,
        rule.name,
        rule.phase.as_str(),
        rule.operator.name(),
        rule.target
    );
    println!("Add it to the `rules:` section of your configuration to activate it:");
    println!("{}", serde_yaml_snippet(&spec));
    Ok(())
}

/// Render a rule spec as a YAML list entry for copy-paste into a config.
fn serde_yaml_snippet(spec: &RuleSpec) -> String {
    let mut lines = vec![
        format!("  - id: {}", spec.id),
        format!("    name: \"{}\"", spec.name),
        format!("    phase: {}", spec.phase.as_str()),
        format!("    operator: {}", spec.operator),
    ];
    if !spec.pattern.is_empty() {
        lines.push(format!("    pattern: \"{}\"", spec.pattern));
    }
    lines.push(format!("    target: \"{}\"", spec.target));
    lines.push(format!("    action: {}", spec.action.as_str()));
    lines.push(format!("    severity: {}", spec.severity.as_str()));
    lines.join("\n")
}

fn analyze_payload(payload: &str) -> Result<()> {
    let entropy = shannon_entropy(payload);
    let engine = RuleEngine::with_default_rules();

    println!("{}", "Payload analysis".bold());
    println!("  Length: {} bytes", payload.len());
    println!("  Shannon entropy: {entropy:.3} bits");

    let mut would_block = false;
    let mut matched_any = false;
    for rule in engine.rules() {
        if rule.matches(payload) {
            matched_any = true;
            if rule.action == RuleAction::Block {
                would_block = true;
            }
            println!(
                "  {} Rule {}: {} ({}, {})",
                "match".red(),
                rule.id,
                rule.name,
                rule.operator.name(),
                rule.severity.as_str()
            );
        }
    }

    if !matched_any {
        println!("  No rules match this payload");
    }
    if would_block {
        println!("{}", "Verdict: would be blocked".bright_red());
    } else {
        println!("{}", "Verdict: would be allowed".green());
    }
    Ok(())
}

fn analyze_log(log_file: &str) -> Result<()> {
    let (events, skipped) = events_from_jsonl(log_file)?;

    let analyzer = EfficacyAnalyzer::new();
    for event in events {
        // Malformed entries were already dropped while reading the file.
        let _ = analyzer.add_event(event);
    }
    analyzer.analyze();

    let summary = analyzer.summary();
    println!("{}", "Event log summary".bold());
    println!("  Events: {}", summary.total_requests);
    println!("  Blocked: {}", summary.total_blocked);
    println!("  Block rate: {:.1}%", summary.block_rate);
    println!("  Rules triggered: {}", summary.total_rules);
    for metrics in analyzer.all_metrics() {
        println!(
            "    {:>6} {:<32} triggers={} blocked={}",
            metrics.rule_id, metrics.rule_name, metrics.total_triggers, metrics.true_positives
        );
    }
    if skipped > 0 {
        println!("  {skipped} malformed events skipped");
    }
    Ok(())
}

fn build_analyzer(log_file: &str) -> Result<(EfficacyAnalyzer, usize)> {
    let (events, skipped) = events_from_jsonl(log_file)?;
    let analyzer = EfficacyAnalyzer::new();
    for event in events {
        let _ = analyzer.add_event(event);
    }
    analyzer.analyze();
    Ok((analyzer, skipped))
}

fn efficacy_report(log_file: &str, format: &str, output: Option<&str>) -> Result<()> {
    let (analyzer, skipped) = build_analyzer(log_file)?;
    let metrics = analyzer.all_metrics();
    let summary = analyzer.summary();

    let rendered = match format {
        "json" => {
            let report = serde_json::json!({
                "summary": summary,
                "rules": metrics,
            });
            serde_json::to_string_pretty(&report)?
        }
        "text" => {
            let mut out = String::new();
            out.push_str(&format!(
                "Efficacy report ({} events, {} blocked, {} rules)\n",
                summary.total_requests, summary.total_blocked, summary.total_rules
            ));
            for m in &metrics {
                out.push_str(&render_metrics_text(m));
            }
            out
        }
        other => bail!("unsupported format: {other}"),
    };

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write report to {path}"))?;
            println!("Report saved to: {path}");
        }
        None => println!("{rendered}"),
    }
    if skipped > 0 {
        eprintln!("warning: {skipped} malformed events skipped");
    }
    Ok(())
}

fn render_metrics_text(m: &RuleMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!("\nRule {} — {}\n", m.rule_id, m.rule_name));
    out.push_str(&format!(
        "  Triggers: {}  TP: {}  FP: {}\n",
        m.total_triggers, m.true_positives, m.false_positives
    ));
    out.push_str(&format!(
        "  Precision: {:.2}  Recall: {:.2}  F1: {:.2}\n",
        m.precision, m.recall, m.f1_score
    ));
    out.push_str(&format!("  Block rate: {:.1}%\n", m.block_rate));
    out.push_str(&format!(
        "  Latency: avg {:.2}ms  min {:.2}ms  max {:.2}ms\n",
        m.avg_latency_ms, m.min_latency_ms, m.max_latency_ms
    ));
    if !m.attack_patterns.is_empty() {
        out.push_str(&format!("  Patterns: {}\n", m.attack_patterns.join("; ")));
    }
    for recommendation in &m.recommendations {
        out.push_str(&format!("  ! {recommendation}\n"));
    }
    out
}

fn efficacy_top(log_file: &str, count: usize) -> Result<()> {
    let (analyzer, _) = build_analyzer(log_file)?;

    println!("{}", format!("Top {count} rules by F1 score").bold());
    for (i, m) in analyzer.top_rules(count).iter().enumerate() {
        println!(
            "  {:>2}. {:<6} {:<32} F1={:.3} precision={:.3} block-rate={:.1}%",
            i + 1,
            m.rule_id,
            m.rule_name,
            m.f1_score,
            m.precision,
            m.block_rate
        );
    }
    Ok(())
}

fn efficacy_problematic(log_file: &str) -> Result<()> {
    let (analyzer, _) = build_analyzer(log_file)?;
    let problematic = analyzer.problematic_rules();

    if problematic.is_empty() {
        println!("No problematic rules found");
        return Ok(());
    }

    println!("{}", "Rules with high false positive rates".bold());
    for m in &problematic {
        println!(
            "  {} {} — {} false positives, precision {:.2}",
            m.rule_id.red(),
            m.rule_name,
            m.false_positives,
            m.precision
        );
        for recommendation in &m.recommendations {
            println!("    ! {recommendation}");
        }
    }
    Ok(())
}

fn efficacy_compare(log_file: &str, rule_id_1: &str, rule_id_2: &str) -> Result<()> {
    let (analyzer, _) = build_analyzer(log_file)?;

    let Some(comparison) = analyzer.compare(rule_id_1, rule_id_2) else {
        bail!("one or both rules not found in the log");
    };

    println!("{}", serde_json::to_string_pretty(&comparison)?);
    Ok(())
}

fn anomaly_detector_from(config_path: Option<&str>) -> Result<AnomalyDetector> {
    let anomaly = match config_path {
        Some(path) => load_config(path)?.anomaly,
        None => Default::default(),
    };
    Ok(AnomalyDetector::new(AnomalyThresholds {
        request_rate: anomaly.request_rate_threshold,
        payload_size: anomaly.payload_size_threshold,
        entropy: anomaly.entropy_threshold,
    }))
}

fn feed_detector(detector: &AnomalyDetector, log_file: &str) -> Result<usize> {
    let (events, skipped) = events_from_jsonl(log_file)?;

    for event in &events {
        let timestamp = event
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let source_ip = event.get("source_ip").and_then(|v| v.as_str()).unwrap_or("");
        let user_agent = event.get("user_agent").and_then(|v| v.as_str()).unwrap_or("");
        let size = event.get("request_size").and_then(|v| v.as_u64()).unwrap_or(0);
        let entropy = event
            .get("payload_entropy")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        detector.record_request(timestamp, source_ip, user_agent, size, entropy);
    }
    Ok(skipped)
}

fn anomaly_report(log_file: &str, config_path: Option<&str>) -> Result<()> {
    let detector = anomaly_detector_from(config_path)?;
    let skipped = feed_detector(&detector, log_file)?;

    let anomalies = detector.anomalies();
    if anomalies.is_empty() {
        println!("No anomalies detected");
    } else {
        println!("{}", format!("{} anomalies detected", anomalies.len()).bold());
        for anomaly in &anomalies {
            let severity = match anomaly.severity.as_str() {
                "critical" => anomaly.severity.bright_red(),
                "high" => anomaly.severity.red(),
                "medium" => anomaly.severity.yellow(),
                _ => anomaly.severity.cyan(),
            };
            println!(
                "  [{}] {} {}: {}",
                anomaly.timestamp.format("%H:%M:%S"),
                severity,
                anomaly.kind,
                anomaly.description
            );
        }
    }
    if skipped > 0 {
        eprintln!("warning: {skipped} malformed events skipped");
    }
    Ok(())
}

fn anomaly_stats(log_file: &str, config_path: Option<&str>) -> Result<()> {
    let detector = anomaly_detector_from(config_path)?;
    let skipped = feed_detector(&detector, log_file)?;

    println!("{}", serde_json::to_string_pretty(&detector.statistics())?);
    if skipped > 0 {
        eprintln!("warning: {skipped} malformed events skipped");
    }
    Ok(())
}

/// Read one JSON object per line, skipping malformed entries.
fn events_from_jsonl(path: &str) -> Result<(Vec<serde_json::Value>, usize)> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;

    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) if value.is_object() => events.push(value),
            _ => skipped += 1,
        }
    }

    Ok((events, skipped))
}
