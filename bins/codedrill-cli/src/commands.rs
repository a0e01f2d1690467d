// CLI commands for working with the problem catalog and the sandbox
use anyhow::{Context, Result};
use codedrill_common::config::Settings;
use codedrill_common::store::ProblemCatalog;
use codedrill_common::types::{ExecutionReport, Problem};
use codedrill_sandbox::policy::Policy;
use codedrill_sandbox::{build_sandbox, Executor, ExecutorConfig};
use std::fs;
use std::path::Path;

const MAX_SHOWN_CHARS: usize = 60;

pub fn load_settings(config: Option<&Path>) -> Result<Settings> {
    match config {
        Some(path) => {
            let mut settings = Settings::load(path)?;
            settings.apply_env(|key| std::env::var(key).ok())?;
            settings.validate()?;
            Ok(settings)
        }
        None => Settings::load_default(),
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read source file {}", path.display()))
}

fn policy(settings: &Settings) -> Result<Policy> {
    Policy::new(
        &settings.sandbox.extra_blocked_modules,
        settings.sandbox.max_source_bytes,
    )
    .context("Failed to compile blocked-capability rules")
}

/// Screen a source file. Returns false when it is blocked.
pub fn check_source(settings: &Settings, source: &Path) -> Result<bool> {
    let code = read_source(source)?;
    let verdict = policy(settings)?.check(&code);

    match verdict.reason {
        Some(reason) if verdict.blocked => {
            println!("❌ {}", reason);
            Ok(false)
        }
        _ => {
            println!("✅ {} passed the policy screen", source.display());
            Ok(true)
        }
    }
}

fn shorten(text: &str) -> String {
    let single_line = text.replace('\n', "\\n");
    if single_line.chars().count() <= MAX_SHOWN_CHARS {
        single_line
    } else {
        let head: String = single_line.chars().take(MAX_SHOWN_CHARS - 3).collect();
        format!("{}...", head)
    }
}

/// Human-readable report table.
pub fn format_report(problem: &Problem, report: &ExecutionReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("📋 {} ({})\n\n", problem.title, problem.id));

    for outcome in &report.outcomes {
        let mark = if outcome.passed { "✅" } else { "❌" };
        out.push_str(&format!("{} #{:<3} {}\n", mark, outcome.fixture_index, shorten(&outcome.input)));
        if !outcome.passed {
            out.push_str(&format!("       expected: {}\n", shorten(&outcome.expected)));
            match &outcome.error {
                Some(error) => out.push_str(&format!("       error:    {}\n", shorten(error))),
                None => out.push_str(&format!("       actual:   {}\n", shorten(&outcome.actual))),
            }
        }
    }

    if let Some(failure) = report.failure {
        out.push_str(&format!("\n⚠️  Request failed as a whole: {}\n", failure));
    }
    out.push_str(&format!(
        "\n{} {}/{} passed\n",
        if report.all_passed { "✅" } else { "❌" },
        report.passed_count(),
        report.outcomes.len()
    ));
    out
}

/// Run a source file against one problem. Returns whether every fixture passed.
pub async fn run_problem(
    settings: &Settings,
    problem_id: &str,
    source: &Path,
    all: bool,
    json: bool,
) -> Result<bool> {
    let catalog = ProblemCatalog::open(&settings.storage.data_dir)?;
    let problem = catalog
        .get(problem_id)
        .with_context(|| format!("Problem '{}' not found in {}", problem_id, catalog.data_dir().display()))?;
    let code = read_source(source)?;

    let sandbox = build_sandbox(&settings.sandbox)?;
    let executor = Executor::new(sandbox, ExecutorConfig::from_settings(&settings.sandbox))?;

    if !json {
        println!(
            "🚀 Running {} against {} ({} sandbox, {} fixtures)",
            source.display(),
            problem.id,
            executor.sandbox_name(),
            if all { "all" } else { "visible" }
        );
    }

    let report = if all {
        executor.run_full(&problem, &code).await
    } else {
        executor.run_visible(&problem, &code).await
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_report(&problem, &report));
    }
    Ok(report.all_passed)
}

pub fn list_problems(settings: &Settings, category: Option<&str>, difficulty: Option<&str>) -> Result<()> {
    let catalog = ProblemCatalog::open(&settings.storage.data_dir)?;
    let problems = catalog.list(category, difficulty);

    if problems.is_empty() {
        println!("No problems match.");
        return Ok(());
    }

    println!("{:<24} {:<32} {:<16} {:<8} {:<6}", "ID", "TITLE", "CATEGORY", "LEVEL", "MIN");
    println!("{}", "─".repeat(90));
    for p in &problems {
        println!(
            "{:<24} {:<32} {:<16} {:<8} {:<6}",
            p.id, p.title, p.category, p.difficulty, p.time_limit_minutes
        );
    }
    println!("\n✅ Total: {} problem(s)", problems.len());
    Ok(())
}

/// Problems in the catalog that would not be usable in a session.
pub fn catalog_warnings(catalog: &ProblemCatalog, policy: &Policy) -> Vec<String> {
    let mut warnings = Vec::new();
    for summary in catalog.list(None, None) {
        let Some(problem) = catalog.get(&summary.id) else {
            continue;
        };
        if problem.test_cases.is_empty() {
            warnings.push(format!("{}: no fixtures", problem.id));
        } else if problem.visible_fixtures().next().is_none() {
            warnings.push(format!("{}: every fixture is hidden", problem.id));
        }
        if let Some(reason) = policy.check(&problem.starter_code).reason {
            warnings.push(format!("{}: starter code is blocked ({})", problem.id, reason));
        }
    }
    warnings
}

/// Load the catalog and print counts. Returns false when warnings were found.
pub fn validate_catalog(settings: &Settings) -> Result<bool> {
    let catalog = ProblemCatalog::open(&settings.storage.data_dir)?;
    let policy = policy(settings)?;

    println!("{:<24} {:>8} {:>8}", "ID", "VISIBLE", "HIDDEN");
    println!("{}", "─".repeat(42));
    for summary in catalog.list(None, None) {
        if let Some(problem) = catalog.get(&summary.id) {
            let visible = problem.visible_fixtures().count();
            let hidden = problem.test_cases.len() - visible;
            println!("{:<24} {:>8} {:>8}", problem.id, visible, hidden);
        }
    }

    let warnings = catalog_warnings(&catalog, &policy);
    for warning in &warnings {
        println!("⚠️  {}", warning);
    }
    println!(
        "\n{} {} problem(s) loaded from {}",
        if warnings.is_empty() { "✅" } else { "⚠️ " },
        catalog.len(),
        catalog.data_dir().display()
    );
    Ok(warnings.is_empty())
}
