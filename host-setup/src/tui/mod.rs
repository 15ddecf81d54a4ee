//! Terminal UI for the first-run setup wizard.
//!
//! - Centered window titled "ODDM Toolkit Setup" with a left banner and one content panel
//! - Bottom button row: [ Next ] [ Close ]
//! - A worker thread owns the `SetupOrchestrator` and its runtime; the UI thread only renders
//!   and forwards operator events
//!
//! Logging is file-only in TUI mode to avoid corrupting the terminal.

use crate::setup::events::{FormField, SetupEvent, SetupForm, SetupPresenter, SetupState};
use crate::setup::orchestrator::SetupOrchestrator;
use crate::setup::storage::{CloudBackupRequest, StorageSelection};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use log::{error, info, warn};
use ratatui::backend::{Backend, CrosstermBackend, TestBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const ASCII_LOGO: &str = r#"  ___  ____  ____  __  __
 / _ \|  _ \|  _ \|  \/  |
| | | | | | | | | | |\/| |
| |_| | |_| | |_| | |  | |
 \___/|____/|____/|_|  |_|

     T O O L K I T"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonFocus {
    Next,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FocusTarget {
    Field(FormField),
    CloudToggle,
    Button(ButtonFocus),
}

#[derive(Debug, Clone)]
struct TextInput {
    value: String,
    cursor: usize,
    masked: bool,
}

impl TextInput {
    fn new(value: impl Into<String>, masked: bool) -> Self {
        let v = value.into();
        Self {
            cursor: v.chars().count(),
            value: v,
            masked,
        }
    }

    fn display(&self) -> String {
        if self.masked {
            "*".repeat(self.value.chars().count())
        } else {
            self.value.clone()
        }
    }

    fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.cursor = self.value.chars().count();
    }

    fn clear(&mut self) {
        self.set(String::new());
    }

    fn byte_index(&self, char_idx: usize) -> usize {
        self.value
            .char_indices()
            .nth(char_idx)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len())
    }

    fn handle_key(&mut self, code: KeyCode) -> bool {
        let len = self.value.chars().count();
        match code {
            KeyCode::Char(c) => {
                let at = self.byte_index(self.cursor);
                self.value.insert(at, c);
                self.cursor += 1;
                true
            }
            KeyCode::Backspace => {
                if self.cursor > 0 {
                    let at = self.byte_index(self.cursor - 1);
                    self.value.remove(at);
                    self.cursor -= 1;
                }
                true
            }
            KeyCode::Delete => {
                if self.cursor < len {
                    let at = self.byte_index(self.cursor);
                    self.value.remove(at);
                }
                true
            }
            KeyCode::Left => {
                self.cursor = self.cursor.saturating_sub(1);
                true
            }
            KeyCode::Right => {
                self.cursor = (self.cursor + 1).min(len);
                true
            }
            KeyCode::Home => {
                self.cursor = 0;
                true
            }
            KeyCode::End => {
                self.cursor = len;
                true
            }
            _ => false,
        }
    }
}

/// Messages from the worker thread.
#[derive(Debug)]
enum UiMsg {
    Advance { state: SetupState, form: SetupForm },
    Error { message: String, fields: Vec<FormField> },
    Fatal(String),
    Idle,
}

enum WorkerCmd {
    Start,
    Event(SetupEvent),
}

/// Forwards orchestrator callbacks to the UI thread.
struct ChannelPresenter {
    tx: mpsc::Sender<UiMsg>,
}

impl SetupPresenter for ChannelPresenter {
    fn show_error(&mut self, message: &str, fields: &[FormField]) {
        let _ = self.tx.send(UiMsg::Error {
            message: message.to_string(),
            fields: fields.to_vec(),
        });
    }

    fn advance_to(&mut self, state: SetupState, form: &SetupForm) {
        let _ = self.tx.send(UiMsg::Advance {
            state,
            form: form.clone(),
        });
    }
}

struct WizardState {
    page: SetupState,
    focus: FocusTarget,
    busy: bool,
    quit: bool,

    admin_password: TextInput,
    service_password: TextInput,
    email: TextInput,
    username: TextInput,
    superuser_password: TextInput,
    confirm_service_password: TextInput,
    confirm_superuser_password: TextInput,
    service_password_locked: bool,

    local_path: TextInput,
    cloud_enabled: bool,
    credential_file: TextInput,
    folder_id: TextInput,

    error: Option<String>,
    highlighted: Vec<FormField>,
    fatal: Option<String>,
}

impl WizardState {
    fn new() -> Self {
        Self {
            page: SetupState::AwaitAdminPassword,
            focus: FocusTarget::Button(ButtonFocus::Next),
            busy: true,
            quit: false,
            admin_password: TextInput::new("", true),
            service_password: TextInput::new("", true),
            email: TextInput::new("", false),
            username: TextInput::new("", false),
            superuser_password: TextInput::new("", true),
            confirm_service_password: TextInput::new("", true),
            confirm_superuser_password: TextInput::new("", true),
            service_password_locked: false,
            local_path: TextInput::new("", false),
            cloud_enabled: false,
            credential_file: TextInput::new("", false),
            folder_id: TextInput::new("", false),
            error: None,
            highlighted: Vec::new(),
            fatal: None,
        }
    }

    fn input(&self, field: FormField) -> &TextInput {
        match field {
            FormField::AdminPassword => &self.admin_password,
            FormField::ServicePassword => &self.service_password,
            FormField::Email => &self.email,
            FormField::Username => &self.username,
            FormField::SuperuserPassword => &self.superuser_password,
            FormField::ConfirmServicePassword => &self.confirm_service_password,
            FormField::ConfirmSuperuserPassword => &self.confirm_superuser_password,
            FormField::LocalPath => &self.local_path,
            FormField::CredentialFile => &self.credential_file,
            FormField::FolderId => &self.folder_id,
        }
    }

    fn input_mut(&mut self, field: FormField) -> &mut TextInput {
        match field {
            FormField::AdminPassword => &mut self.admin_password,
            FormField::ServicePassword => &mut self.service_password,
            FormField::Email => &mut self.email,
            FormField::Username => &mut self.username,
            FormField::SuperuserPassword => &mut self.superuser_password,
            FormField::ConfirmServicePassword => &mut self.confirm_service_password,
            FormField::ConfirmSuperuserPassword => &mut self.confirm_superuser_password,
            FormField::LocalPath => &mut self.local_path,
            FormField::CredentialFile => &mut self.credential_file,
            FormField::FolderId => &mut self.folder_id,
        }
    }
}

fn field_label(field: FormField) -> &'static str {
    match field {
        FormField::AdminPassword => "postgres password",
        FormField::ServicePassword => "Service role password",
        FormField::Email => "Superuser email",
        FormField::Username => "Superuser name",
        FormField::SuperuserPassword => "Superuser password",
        FormField::ConfirmServicePassword => "Re-enter service role password",
        FormField::ConfirmSuperuserPassword => "Re-enter superuser password",
        FormField::LocalPath => "Local data folder",
        FormField::CredentialFile => "Service account JSON",
        FormField::FolderId => "Drive folder ID",
    }
}

/// Focus stops for the current page, in tab order.
fn focus_order(state: &WizardState) -> Vec<FocusTarget> {
    let mut order: Vec<FocusTarget> = match state.page {
        SetupState::AwaitAdminPassword => vec![FocusTarget::Field(FormField::AdminPassword)],
        SetupState::AwaitUserDetails => {
            let mut v = Vec::new();
            if !state.service_password_locked {
                v.push(FocusTarget::Field(FormField::ServicePassword));
            }
            v.push(FocusTarget::Field(FormField::Email));
            v.push(FocusTarget::Field(FormField::Username));
            v.push(FocusTarget::Field(FormField::SuperuserPassword));
            v
        }
        SetupState::AwaitPasswordReVerification => {
            let mut v = Vec::new();
            if !state.service_password_locked {
                v.push(FocusTarget::Field(FormField::ConfirmServicePassword));
            }
            v.push(FocusTarget::Field(FormField::ConfirmSuperuserPassword));
            v
        }
        SetupState::AwaitStorageSelection => {
            let mut v = vec![
                FocusTarget::Field(FormField::LocalPath),
                FocusTarget::CloudToggle,
            ];
            if state.cloud_enabled {
                v.push(FocusTarget::Field(FormField::CredentialFile));
                v.push(FocusTarget::Field(FormField::FolderId));
            }
            v
        }
        _ => Vec::new(),
    };
    if state.page != SetupState::Provisioning {
        order.push(FocusTarget::Button(ButtonFocus::Next));
        order.push(FocusTarget::Button(ButtonFocus::Close));
    }
    order
}

fn move_focus(state: &mut WizardState, forward: bool) {
    let order = focus_order(state);
    if order.is_empty() {
        return;
    }
    let idx = order.iter().position(|f| *f == state.focus).unwrap_or(0);
    let next = if forward {
        (idx + 1) % order.len()
    } else {
        (idx + order.len() - 1) % order.len()
    };
    state.focus = order[next];
}

fn first_focus(state: &WizardState) -> FocusTarget {
    let order = focus_order(state);
    state
        .highlighted
        .iter()
        .map(|f| FocusTarget::Field(*f))
        .find(|f| order.contains(f))
        .or_else(|| order.first().copied())
        .unwrap_or(FocusTarget::Button(ButtonFocus::Next))
}

fn next_label(page: SetupState) -> &'static str {
    match page {
        SetupState::AlreadySetUp => "Run again",
        SetupState::AwaitReAuthConsent => "Yes",
        SetupState::AwaitStorageSelection => "Finish",
        SetupState::Completed => "Close",
        _ => "Next",
    }
}

fn close_label(page: SetupState) -> &'static str {
    match page {
        SetupState::AwaitReAuthConsent => "No",
        _ => "Close",
    }
}

/// The event the Next button produces on the current page.
fn build_event(state: &WizardState) -> Option<SetupEvent> {
    match state.page {
        SetupState::AlreadySetUp | SetupState::AwaitReAuthConsent => Some(SetupEvent::Proceed),
        SetupState::AwaitAdminPassword => Some(SetupEvent::AdminPasswordSubmitted {
            password: state.admin_password.value.clone(),
        }),
        SetupState::AwaitUserDetails => Some(SetupEvent::UserDetailsSubmitted {
            service_password: state.service_password.value.clone(),
            email: state.email.value.clone(),
            username: state.username.value.clone(),
            superuser_password: state.superuser_password.value.clone(),
        }),
        SetupState::AwaitPasswordReVerification => Some(SetupEvent::PasswordsReVerified {
            service_password: state.confirm_service_password.value.clone(),
            superuser_password: state.confirm_superuser_password.value.clone(),
        }),
        SetupState::AwaitStorageSelection => {
            let cloud = state.cloud_enabled.then(|| CloudBackupRequest {
                credential_file: PathBuf::from(state.credential_file.value.trim()),
                folder_id: state.folder_id.value.clone(),
            });
            Some(SetupEvent::StorageSubmitted(StorageSelection {
                local_path: PathBuf::from(state.local_path.value.trim()),
                cloud,
            }))
        }
        SetupState::Completed => Some(SetupEvent::Close),
        SetupState::Provisioning | SetupState::Closed => None,
    }
}

fn apply_message(state: &mut WizardState, msg: UiMsg) {
    match msg {
        UiMsg::Advance { state: page, form } => {
            let entering = state.page != page;
            state.page = page;
            state.service_password.set(form.service_password);
            state.email.set(form.email);
            state.username.set(form.username);
            state.superuser_password.set(form.superuser_password);
            state.service_password_locked = form.service_password_locked;
            if state.local_path.value.is_empty() || entering {
                state.local_path.set(form.local_path.to_string_lossy());
            }
            if page == SetupState::AwaitPasswordReVerification {
                state.confirm_service_password.clear();
                state.confirm_superuser_password.clear();
            }
            if page != SetupState::AwaitAdminPassword {
                state.admin_password.clear();
            }
            state.highlighted = form.highlighted;
            state.error = None;
            state.focus = first_focus(state);
            if page.is_terminal() {
                state.quit = true;
            }
        }
        UiMsg::Error { message, fields } => {
            if state.page == SetupState::AwaitAdminPassword
                && fields.contains(&FormField::AdminPassword)
            {
                state.admin_password.clear();
            }
            state.error = Some(message);
            state.highlighted = fields;
            state.focus = first_focus(state);
        }
        UiMsg::Fatal(message) => {
            state.fatal = Some(message);
        }
        UiMsg::Idle => {
            state.busy = false;
        }
    }
}

fn drain_messages(state: &mut WizardState, rx: &mpsc::Receiver<UiMsg>) {
    while let Ok(msg) = rx.try_recv() {
        apply_message(state, msg);
    }
}

/// Send the page's event to the worker unless a previous one is still running.
fn submit(state: &mut WizardState, cmd: &mpsc::Sender<WorkerCmd>, event: SetupEvent) {
    if state.busy {
        warn!(
            "[PHASE: tui] [STEP: submit] Ignoring {} while a request is running",
            event.name()
        );
        return;
    }
    state.busy = true;
    state.error = None;
    if cmd.send(WorkerCmd::Event(event)).is_err() {
        state.fatal = Some("The setup worker stopped unexpectedly.".to_string());
        state.busy = false;
    }
}

fn handle_key(state: &mut WizardState, code: KeyCode, cmd: &mpsc::Sender<WorkerCmd>) {
    if state.fatal.is_some() {
        state.quit = true;
        return;
    }
    if state.busy {
        return;
    }

    match code {
        KeyCode::Esc => submit(state, cmd, SetupEvent::Close),
        KeyCode::Tab | KeyCode::Down => move_focus(state, true),
        KeyCode::BackTab | KeyCode::Up => move_focus(state, false),
        KeyCode::Enter => {
            // Enter walks through the inputs and submits from the last one.
            let order = focus_order(state);
            let last_input = order
                .iter()
                .position(|f| *f == state.focus)
                .and_then(|i| order.get(i + 1))
                .map_or(true, |f| matches!(f, FocusTarget::Button(_)));
            match state.focus {
                FocusTarget::Button(ButtonFocus::Close) => submit(state, cmd, SetupEvent::Close),
                FocusTarget::Field(_) | FocusTarget::CloudToggle if !last_input => {
                    move_focus(state, true)
                }
                _ => {
                    if let Some(event) = build_event(state) {
                        submit(state, cmd, event);
                    }
                }
            }
        }
        KeyCode::Char(' ') if state.focus == FocusTarget::CloudToggle => {
            state.cloud_enabled = !state.cloud_enabled;
        }
        KeyCode::Left | KeyCode::Right if matches!(state.focus, FocusTarget::Button(_)) => {
            state.focus = match state.focus {
                FocusTarget::Button(ButtonFocus::Next) => FocusTarget::Button(ButtonFocus::Close),
                _ => FocusTarget::Button(ButtonFocus::Next),
            };
        }
        other => {
            if let FocusTarget::Field(field) = state.focus {
                state.input_mut(field).handle_key(other);
            }
        }
    }
}

/// Run the interactive wizard until the operator closes it.
pub fn run(orchestrator: SetupOrchestrator) -> Result<()> {
    info!("[PHASE: tui] [STEP: start] Starting TUI wizard");

    let (ui_tx, ui_rx) = mpsc::channel::<UiMsg>();
    let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCmd>();
    let worker = spawn_worker(orchestrator, cmd_rx, ui_tx);

    let mut terminal = setup_terminal()?;
    let result = run_loop(&mut terminal, &ui_rx, &cmd_tx);
    restore_terminal(&mut terminal)?;

    drop(cmd_tx);
    if worker.join().is_err() {
        error!("[PHASE: tui] [STEP: shutdown] Setup worker panicked");
    }
    result
}

fn spawn_worker(
    mut orchestrator: SetupOrchestrator,
    cmd_rx: mpsc::Receiver<WorkerCmd>,
    ui_tx: mpsc::Sender<UiMsg>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = ui_tx.send(UiMsg::Fatal(format!("Failed to start runtime: {}", e)));
                return;
            }
        };
        let mut presenter = ChannelPresenter { tx: ui_tx.clone() };

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                WorkerCmd::Start => {
                    orchestrator.start(&mut presenter);
                }
                WorkerCmd::Event(event) => {
                    if let Err(e) = rt.block_on(orchestrator.dispatch(event, &mut presenter)) {
                        if !e.is_recoverable() {
                            let _ = ui_tx.send(UiMsg::Fatal(e.to_string()));
                        }
                    }
                }
            }
            let _ = ui_tx.send(UiMsg::Idle);
            if orchestrator.state().is_terminal() {
                break;
            }
        }

        if !orchestrator.state().is_terminal() {
            rt.block_on(orchestrator.shutdown());
        }
    })
}

/// Non-interactive smoke mode: render a single frame and exit.
/// Target pages: already|admin|consent|details|verify|provisioning|storage|complete
pub fn smoke(target: &str) -> Result<()> {
    info!(
        "[PHASE: tui] [STEP: smoke] Rendering single-frame TUI smoke target={}",
        target
    );
    let state = new_smoke_wizard_state(target.trim().to_ascii_lowercase().as_str());
    render_frame(&state, 100, 30)?;
    Ok(())
}

fn render_frame(state: &WizardState, width: u16, height: u16) -> Result<Terminal<TestBackend>> {
    let backend = TestBackend::new(width, height);
    let mut terminal = Terminal::new(backend)?;
    terminal.draw(|f| draw(f.size(), f, state))?;
    Ok(terminal)
}

fn new_smoke_wizard_state(target: &str) -> WizardState {
    // Smoke-only sample values; the interactive run starts empty.
    let mut state = WizardState::new();
    state.busy = false;
    state.page = match target {
        "already" => SetupState::AlreadySetUp,
        "consent" => SetupState::AwaitReAuthConsent,
        "details" => SetupState::AwaitUserDetails,
        "verify" => SetupState::AwaitPasswordReVerification,
        "provisioning" => SetupState::Provisioning,
        "storage" => SetupState::AwaitStorageSelection,
        "complete" => SetupState::Completed,
        _ => SetupState::AwaitAdminPassword,
    };
    state.email.set("admin@example.com");
    state.username.set("admin");
    state.local_path.set("/opt/oddm/ODDM_data");
    if state.page == SetupState::AwaitStorageSelection {
        state.cloud_enabled = true;
        state.credential_file.set("/opt/oddm/service-account.json");
    }
    state.focus = first_focus(&state);
    state
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    ui_rx: &mpsc::Receiver<UiMsg>,
    cmd_tx: &mpsc::Sender<WorkerCmd>,
) -> Result<()> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut state = WizardState::new();

    if cmd_tx.send(WorkerCmd::Start).is_err() {
        anyhow::bail!("setup worker exited before start");
    }

    while !state.quit {
        drain_messages(&mut state, ui_rx);
        if state.quit {
            break;
        }
        terminal.draw(|f| draw(f.size(), f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_millis(0));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    handle_key(&mut state, key.code, cmd_tx);
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }

    Ok(())
}

fn field_line(state: &WizardState, field: FormField) -> Line<'static> {
    let focused = state.focus == FocusTarget::Field(field);
    let flagged = state.highlighted.contains(&field);
    let mut label_style = Style::default();
    if flagged {
        label_style = label_style.fg(Color::Red);
    }
    let mut value_style = Style::default();
    if focused {
        value_style = value_style.add_modifier(Modifier::REVERSED);
    }
    Line::from(vec![
        Span::styled(format!("{:<32}", field_label(field)), label_style),
        Span::styled(format!("[{}]", state.input(field).display()), value_style),
    ])
}

fn page_body(state: &WizardState) -> Vec<Line<'static>> {
    match state.page {
        SetupState::AlreadySetUp => vec![
            Line::from("ODDM Toolkit setup has already been completed on this machine."),
            Line::from(""),
            Line::from("Running setup again will ask for the postgres password and"),
            Line::from("re-check the toolkit database."),
        ],
        SetupState::AwaitAdminPassword => vec![
            Line::from("Enter the password of the PostgreSQL 'postgres' superuser."),
            Line::from(""),
            field_line(state, FormField::AdminPassword),
        ],
        SetupState::AwaitReAuthConsent => vec![
            Line::from("An ODDM Toolkit admin user already exists."),
            Line::from(""),
            Line::from("Do you want to continue and create another superuser?"),
        ],
        SetupState::AwaitUserDetails => {
            let mut lines = vec![
                Line::from("Choose the service role password and the first superuser."),
                Line::from(""),
            ];
            if state.service_password_locked {
                lines.push(Line::from(format!(
                    "{:<32}(already verified)",
                    field_label(FormField::ServicePassword)
                )));
            } else {
                lines.push(field_line(state, FormField::ServicePassword));
            }
            lines.push(field_line(state, FormField::Email));
            lines.push(field_line(state, FormField::Username));
            lines.push(field_line(state, FormField::SuperuserPassword));
            lines
        }
        SetupState::AwaitPasswordReVerification => {
            let mut lines = vec![Line::from("Re-enter the passwords to confirm."), Line::from("")];
            if !state.service_password_locked {
                lines.push(field_line(state, FormField::ConfirmServicePassword));
            }
            lines.push(field_line(state, FormField::ConfirmSuperuserPassword));
            lines
        }
        SetupState::Provisioning => vec![
            Line::from("Creating the ODDM Toolkit database, service role and superuser..."),
            Line::from(""),
            Line::from("Please wait."),
        ],
        SetupState::AwaitStorageSelection => {
            let toggle = if state.cloud_enabled { "[x]" } else { "[ ]" };
            let toggle_style = if state.focus == FocusTarget::CloudToggle {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            let mut lines = vec![
                Line::from("Choose where ODDM stores its data."),
                Line::from(""),
                field_line(state, FormField::LocalPath),
                Line::from(""),
                Line::from(Span::styled(
                    format!("{} Back up to Google Drive", toggle),
                    toggle_style,
                )),
            ];
            if state.cloud_enabled {
                lines.push(field_line(state, FormField::CredentialFile));
                lines.push(field_line(state, FormField::FolderId));
            }
            lines.push(Line::from(""));
            lines.push(Line::from("Space toggles the checkbox."));
            lines
        }
        SetupState::Completed => vec![
            Line::from("ODDM Toolkit setup is complete."),
            Line::from(""),
            Line::from(format!("Data folder: {}", state.local_path.value)),
        ],
        SetupState::Closed => Vec::new(),
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame<'_>, state: &WizardState) {
    let window_area = centered_window(area, 100, 30);

    let outer_block = Block::default()
        .borders(Borders::ALL)
        .title("ODDM Toolkit Setup");
    f.render_widget(outer_block, window_area);

    let inner = window_area.inner(&ratatui::layout::Margin {
        vertical: 1,
        horizontal: 1,
    });
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)].as_ref())
        .split(inner);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(30), Constraint::Min(0)].as_ref())
        .split(rows[0]);

    let logo = Paragraph::new(ASCII_LOGO)
        .block(Block::default().borders(Borders::ALL))
        .alignment(Alignment::Left);
    f.render_widget(logo, cols[0]);

    let mut lines = page_body(state);
    if let Some(err) = &state.error {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            err.clone(),
            Style::default().fg(Color::Red),
        )));
    }
    if state.busy && state.page != SetupState::Provisioning {
        lines.push(Line::from(""));
        lines.push(Line::from("Working..."));
    }
    let content = Paragraph::new(Text::from(lines))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(state.page.title()),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(content, cols[1]);

    draw_buttons(f, rows[1], state);

    if let Some(message) = &state.fatal {
        draw_message_modal(f, window_area, "Setup failed", message);
    }
}

fn centered_window(area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(area.width.saturating_sub(2)).max(60).min(area.width);
    let h = height.min(area.height.saturating_sub(2)).max(20).min(area.height);
    let x = area.x + (area.width.saturating_sub(w)) / 2;
    let y = area.y + (area.height.saturating_sub(h)) / 2;
    Rect {
        x,
        y,
        width: w,
        height: h,
    }
}

fn draw_buttons(f: &mut ratatui::Frame<'_>, area: Rect, state: &WizardState) {
    let enabled = !state.busy && state.page != SetupState::Provisioning;
    let next = button_text(
        next_label(state.page),
        state.focus == FocusTarget::Button(ButtonFocus::Next),
        enabled,
    );
    let close = button_text(
        close_label(state.page),
        state.focus == FocusTarget::Button(ButtonFocus::Close),
        enabled,
    );
    let line = Line::from(vec![next, Span::raw(" "), close]);
    let p = Paragraph::new(Text::from(line)).alignment(Alignment::Right);
    f.render_widget(p, area);
}

fn button_text(label: &str, focused: bool, enabled: bool) -> Span<'static> {
    let mut style = Style::default();
    if !enabled {
        style = style.fg(Color::DarkGray);
    }
    if focused && enabled {
        style = style.add_modifier(Modifier::REVERSED);
    }
    Span::styled(format!("[ {} ]", label), style)
}

fn draw_message_modal(f: &mut ratatui::Frame<'_>, window_area: Rect, title: &str, body: &str) {
    let modal_w = 70u16.min(window_area.width.saturating_sub(4)).max(40);
    let modal_h = 8u16.min(window_area.height.saturating_sub(4)).max(6);
    let x = window_area.x + (window_area.width.saturating_sub(modal_w)) / 2;
    let y = window_area.y + (window_area.height.saturating_sub(modal_h)) / 2;
    let area = Rect {
        x,
        y,
        width: modal_w,
        height: modal_h,
    };

    f.render_widget(ratatui::widgets::Clear, area);
    let text = Text::from(vec![
        Line::from(body.to_string()),
        Line::from(""),
        Line::from("Press any key to exit. Details are in the setup log."),
    ]);
    let p = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen(state: &WizardState) -> String {
        let terminal = render_frame(state, 100, 30).unwrap();
        let buffer = terminal.backend().buffer();
        buffer
            .content
            .chunks(buffer.area.width as usize)
            .map(|row| row.iter().map(|c| c.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn every_smoke_target_renders() {
        for target in [
            "already",
            "admin",
            "consent",
            "details",
            "verify",
            "provisioning",
            "storage",
            "complete",
        ] {
            smoke(target).unwrap();
        }
    }

    #[test]
    fn passwords_are_masked_on_screen() {
        let mut state = new_smoke_wizard_state("admin");
        state.admin_password.set("s3cret");
        let out = screen(&state);
        assert!(out.contains("******"));
        assert!(!out.contains("s3cret"));
    }

    #[test]
    fn errors_are_rendered() {
        let mut state = new_smoke_wizard_state("admin");
        state.error = Some("Incorrect password. Please try again.".into());
        assert!(screen(&state).contains("Incorrect password"));
    }

    #[test]
    fn text_input_edits_at_cursor() {
        let mut input = TextInput::new("ac", false);
        input.handle_key(KeyCode::Left);
        input.handle_key(KeyCode::Char('b'));
        assert_eq!(input.value, "abc");
        input.handle_key(KeyCode::End);
        input.handle_key(KeyCode::Backspace);
        assert_eq!(input.value, "ab");
        input.handle_key(KeyCode::Home);
        input.handle_key(KeyCode::Delete);
        assert_eq!(input.value, "b");
    }

    #[test]
    fn text_input_handles_multibyte_chars() {
        let mut input = TextInput::new("é", false);
        input.handle_key(KeyCode::Char('x'));
        input.handle_key(KeyCode::Left);
        input.handle_key(KeyCode::Backspace);
        assert_eq!(input.value, "x");
    }

    #[test]
    fn locked_service_password_is_skipped() {
        let mut state = new_smoke_wizard_state("verify");
        state.service_password_locked = true;
        let order = focus_order(&state);
        assert!(!order.contains(&FocusTarget::Field(FormField::ConfirmServicePassword)));
        assert_eq!(
            order.first(),
            Some(&FocusTarget::Field(FormField::ConfirmSuperuserPassword))
        );
    }

    #[test]
    fn storage_event_carries_cloud_request_only_when_enabled() {
        let mut state = new_smoke_wizard_state("storage");
        state.folder_id.set("abc");
        match build_event(&state) {
            Some(SetupEvent::StorageSubmitted(sel)) => {
                let cloud = sel.cloud.unwrap();
                assert_eq!(cloud.folder_id, "abc");
                assert_eq!(sel.local_path, PathBuf::from("/opt/oddm/ODDM_data"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        state.cloud_enabled = false;
        match build_event(&state) {
            Some(SetupEvent::StorageSubmitted(sel)) => assert!(sel.cloud.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn busy_state_blocks_a_second_submit() {
        let (tx, rx) = mpsc::channel();
        let mut state = new_smoke_wizard_state("admin");
        state.focus = FocusTarget::Button(ButtonFocus::Next);

        handle_key(&mut state, KeyCode::Enter, &tx);
        handle_key(&mut state, KeyCode::Enter, &tx);

        assert!(state.busy);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn rejected_admin_password_is_cleared() {
        let mut state = WizardState::new();
        state.page = SetupState::AwaitAdminPassword;
        state.admin_password.set("wrong-pw");

        apply_message(
            &mut state,
            UiMsg::Error {
                message: "Incorrect password. Please try again.".into(),
                fields: vec![FormField::AdminPassword],
            },
        );
        assert_eq!(state.admin_password.value, "");
        assert_eq!(
            state.error.as_deref(),
            Some("Incorrect password. Please try again.")
        );
        assert_eq!(state.focus, FocusTarget::Field(FormField::AdminPassword));
    }

    #[test]
    fn errors_on_other_fields_keep_typed_input() {
        let mut state = WizardState::new();
        state.page = SetupState::AwaitUserDetails;
        state.email.set("not-an-email");

        apply_message(
            &mut state,
            UiMsg::Error {
                message: "Invalid email address. Please enter a valid email.".into(),
                fields: vec![FormField::Email],
            },
        );
        assert_eq!(state.email.value, "not-an-email");
    }

    #[test]
    fn advance_prefills_and_closed_quits() {
        let mut state = WizardState::new();
        let form = SetupForm {
            email: "a@example.com".into(),
            highlighted: vec![FormField::Email],
            ..SetupForm::default()
        };
        apply_message(
            &mut state,
            UiMsg::Advance {
                state: SetupState::AwaitUserDetails,
                form,
            },
        );
        assert_eq!(state.email.value, "a@example.com");
        assert_eq!(state.focus, FocusTarget::Field(FormField::Email));

        apply_message(&mut state, UiMsg::Idle);
        assert!(!state.busy);

        apply_message(
            &mut state,
            UiMsg::Advance {
                state: SetupState::Closed,
                form: SetupForm::default(),
            },
        );
        assert!(state.quit);
    }
}
