//! Console observer for a session's events.
//!
//! Build output goes to stdout; diagnostics and failures go to stderr. Every
//! event is also traced so the log file has the full picture.

use qbs_session::{EventHub, MessageResult, ProcessResult, Subscriptions};

/// Subscribe console printers to every event the CLI reports on. Dropping
/// the returned bag detaches them.
pub fn attach(hub: &EventHub, verbose: bool) -> Subscriptions {
    let mut subs = Subscriptions::default();

    subs.push(hub.status_changed.subscribe(|status| {
        tracing::info!(%status, "Session status changed");
    }));
    subs.push(hub.project_activated.subscribe(|path| {
        tracing::info!(project = %path.display(), "Project activated");
    }));
    subs.push(hub.hello.subscribe(|hello| {
        tracing::info!(
            api_level = hello.api_level,
            api_compat_level = hello.api_compat_level,
            "Connected to qbs"
        );
    }));

    subs.push(hub.project_resolved.subscribe(|result| {
        report_result("Resolve", result);
    }));
    subs.push(hub.project_built.subscribe(|result| {
        report_result("Build", result);
    }));
    subs.push(hub.project_cleaned.subscribe(|result| {
        report_result("Clean", result);
    }));
    subs.push(hub.project_installed.subscribe(|result| {
        report_result("Install", result);
    }));

    subs.push(hub.log_message.subscribe(|message| {
        for item in message.items() {
            println!("{item}");
        }
    }));
    subs.push(hub.warning_message.subscribe(|message| {
        tracing::warn!("{message}");
        for item in message.items() {
            eprintln!("warning: {item}");
        }
    }));
    subs.push(hub.command_description.subscribe(|message| {
        for item in message.items() {
            println!("{item}");
        }
    }));
    subs.push(hub.process_result.subscribe(report_process));

    if verbose {
        subs.push(hub.task_started.subscribe(|task| {
            eprintln!("{} (0/{})", task.description, task.max_progress);
        }));
        subs.push(hub.task_progress.subscribe(|task| {
            tracing::debug!(progress = task.progress, "Task progress");
        }));
        subs.push(hub.task_max_progress.subscribe(|task| {
            tracing::debug!(max_progress = task.max_progress, "Task max progress");
        }));
    }

    subs.push(hub.error.subscribe(|err| {
        tracing::error!("{err}");
        eprintln!("error: {err}");
    }));

    subs
}

fn report_result(operation: &str, result: &MessageResult) {
    if result.is_empty() {
        tracing::info!("{operation} succeeded");
        return;
    }
    tracing::warn!("{operation} failed: {result}");
    for item in result.items() {
        eprintln!("error: {item}");
    }
}

fn report_process(process: &ProcessResult) {
    for line in &process.stdout {
        println!("{line}");
    }
    for line in &process.stderr {
        eprintln!("{line}");
    }
    if !process.success {
        tracing::warn!(
            executable = %process.executable_file_path,
            exit_code = process.exit_code,
            "Process failed"
        );
        eprintln!(
            "{} exited with code {}",
            process.executable_file_path, process.exit_code
        );
    }
}
