fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Print whether setup has completed on this machine and exit 0/1.
    if args.iter().any(|a| a == "--status") {
        std::process::exit(oddm_host_setup::run_status());
    }

    // Non-interactive TUI smoke test mode (for automated checks).
    // Usage: --tui-smoke or --tui-smoke=already|admin|consent|details|verify|provisioning|storage|complete
    if let Some(arg) = args
        .iter()
        .find(|a| a.as_str() == "--tui-smoke" || a.starts_with("--tui-smoke="))
    {
        let target = arg
            .split_once('=')
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.trim().is_empty());
        oddm_host_setup::run_tui_smoke(target);
        return;
    }

    // Default (and --tui): interactive wizard.
    oddm_host_setup::run_tui();
}
