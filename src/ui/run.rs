use crate::browser::PageDriver;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::orchestrator::{PageContext, PageEvent, PageOrchestrator, WidgetView};
use crate::service::OverlayService;
use crate::ui::app::{AppState, Body, WIDGET_WIDTH};
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use std::path::PathBuf;
use std::time::{Duration as StdDuration, Instant};

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_OPUS: Color = Color::Magenta;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_ERROR: Color = Color::Red;
const COLOR_MUTED: Color = Color::DarkGray;

const TICK: StdDuration = StdDuration::from_millis(500);

/// Which page the widget is "sitting on".
pub struct WatchTarget {
    pub elsewhere_url: String,
    pub page_file: Option<PathBuf>,
    pub start_on_usage_page: bool,
}

pub async fn run_tui<D: PageDriver>(
    cfg: &AppConfig,
    service: &OverlayService<D>,
    target: WatchTarget,
) -> Result<(), AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, cfg, service, &target).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

fn page_context(cfg: &AppConfig, target: &WatchTarget, on_usage_page: bool) -> PageContext {
    if !on_usage_page {
        return PageContext {
            url: target.elsewhere_url.clone(),
            text: None,
        };
    }
    let text = target.page_file.as_ref().and_then(|path| {
        std::fs::read_to_string(path)
            .map_err(|e| tracing::warn!(path = %path.display(), error = %e, "cannot read page file"))
            .ok()
    });
    PageContext {
        url: cfg.target_url.clone(),
        text,
    }
}

async fn run_loop<D: PageDriver>(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    cfg: &AppConfig,
    service: &OverlayService<D>,
    target: &WatchTarget,
) -> Result<(), AppError> {
    let store = service.store();
    let mut orchestrator = PageOrchestrator::new(service.coordinator().clone(), cfg);
    let mut state = AppState {
        widget: store.widget_state()?,
        on_usage_page: target.start_on_usage_page,
        ..AppState::default()
    };
    let mut last_seen: Option<DateTime<Utc>> = None;

    terminal.draw(|f| render(f, &state))?;
    let ctx = page_context(cfg, target, state.on_usage_page);
    let view = orchestrator.handle(PageEvent::Loaded(ctx), Instant::now()).await?;
    note_view(&mut state, &view, &mut last_seen);

    while state.running {
        state.fetching = service.coordinator().is_in_flight();
        state.auto_refresh = orchestrator.auto_refresh_active();
        terminal.draw(|f| render(f, &state))?;

        if event::poll(TICK)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    handle_key(
                        key.code,
                        key.modifiers,
                        &mut state,
                        &mut orchestrator,
                        service,
                        cfg,
                        target,
                        &mut last_seen,
                    )
                    .await?;
                }
            }
        }

        if orchestrator.refresh_due(Instant::now()) {
            let ctx = page_context(cfg, target, true);
            let view = orchestrator.refresh_live(ctx.text.as_deref())?;
            note_view(&mut state, &view, &mut last_seen);
            state.status = "auto-refreshed".into();
        }

        if let Some(outcome) = orchestrator.take_finished_fetch().await {
            match outcome {
                Ok(record) => {
                    last_seen = Some(record.captured_at);
                    state.apply_record(&record);
                    state.status = "fetched".into();
                }
                Err(e) => state.status = format!("fetch failed: {e}"),
            }
        }

        // Another process may have refreshed the shared cache.
        if !state.on_usage_page {
            if let Some(record) = store.get()? {
                if last_seen.map_or(true, |seen| record.captured_at > seen) {
                    last_seen = Some(record.captured_at);
                    state.apply_record(&record);
                }
            }
        }
    }

    Ok(())
}

fn note_view(state: &mut AppState, view: &WidgetView, last_seen: &mut Option<DateTime<Utc>>) {
    if let WidgetView::Live(record) | WidgetView::Cached { record, .. } = view {
        *last_seen = Some(record.captured_at);
    }
    state.apply_view(view);
}

#[allow(clippy::too_many_arguments)]
async fn handle_key<D: PageDriver>(
    code: KeyCode,
    modifiers: KeyModifiers,
    state: &mut AppState,
    orchestrator: &mut PageOrchestrator<D>,
    service: &OverlayService<D>,
    cfg: &AppConfig,
    target: &WatchTarget,
    last_seen: &mut Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    let store = service.store();

    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        state.running = false;
        return Ok(());
    }

    match code {
        KeyCode::Char('q') | KeyCode::Esc => state.running = false,
        KeyCode::Char('r') => {
            if state.on_usage_page {
                let ctx = page_context(cfg, target, true);
                let view = orchestrator.refresh_live(ctx.text.as_deref())?;
                note_view(state, &view, last_seen);
            } else {
                state.body = Body::Loading;
                orchestrator.start_background_fetch();
            }
            state.status = "refreshing".into();
        }
        KeyCode::Char('n') => {
            state.on_usage_page = !state.on_usage_page;
            let ctx = page_context(cfg, target, state.on_usage_page);
            state.status = format!("navigated to {}", ctx.url);
            let view = orchestrator.handle(PageEvent::Navigated(ctx), Instant::now()).await?;
            note_view(state, &view, last_seen);
        }
        KeyCode::Char('c') => {
            state.widget.collapsed = !state.widget.collapsed;
            store.set_widget_collapsed(state.widget.collapsed)?;
        }
        KeyCode::Char('w') => {
            state.widget.visible = service.toggle_widget()?;
        }
        KeyCode::Left | KeyCode::Right | KeyCode::Up | KeyCode::Down => {
            let (dx, dy) = match code {
                KeyCode::Left => (-2, 0),
                KeyCode::Right => (2, 0),
                KeyCode::Up => (0, -1),
                _ => (0, 1),
            };
            let position = state.nudge(dx, dy);
            store.set_widget_position(position)?;
        }
        _ => {}
    }
    Ok(())
}

fn widget_height(state: &AppState) -> u16 {
    if state.widget.collapsed {
        return 3;
    }
    match &state.body {
        Body::Usage { rows, stale, .. } => 2 + rows.len() as u16 * 3 + 1 + u16::from(*stale),
        _ => 6,
    }
}

fn widget_area(state: &AppState, screen: Rect) -> Rect {
    let width = WIDGET_WIDTH.min(screen.width);
    let height = widget_height(state).min(screen.height.saturating_sub(1));
    let (x, y) = match state.widget.position {
        Some(pos) => (pos.x.max(0) as u16, pos.y.max(0) as u16),
        None => (screen.width.saturating_sub(width + 2), 1),
    };
    Rect {
        x: x.min(screen.width.saturating_sub(width)),
        y: y.min(screen.height.saturating_sub(height + 1)),
        width,
        height,
    }
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let size = f.area();
    let page = match (state.on_usage_page, state.auto_refresh) {
        (true, true) => "usage page (auto)",
        (true, false) => "usage page",
        _ => "elsewhere",
    };
    let status = if state.fetching { "fetching..." } else { state.status.as_str() };
    let footer = Paragraph::new(format!(
        " {page} · {status} · r refresh · n navigate · c collapse · w show/hide · arrows move · q quit"
    ))
    .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(
        footer,
        Rect {
            y: size.height.saturating_sub(1),
            height: size.height.min(1),
            ..size
        },
    );

    if !state.widget.visible {
        return;
    }

    let area = widget_area(state, size);
    f.render_widget(Clear, area);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Claude usage ")
        .border_style(Style::default().fg(COLOR_ACCENT));
    let inner = block.inner(area);
    f.render_widget(block, area);

    if state.widget.collapsed {
        return;
    }

    match &state.body {
        Body::Loading => {
            f.render_widget(Paragraph::new("Loading..."), inner);
        }
        Body::Info(msg) => {
            f.render_widget(Paragraph::new(msg.as_str()).wrap(Wrap { trim: true }), inner);
        }
        Body::Error(msg) => {
            f.render_widget(
                Paragraph::new(msg.as_str())
                    .style(Style::default().fg(COLOR_ERROR))
                    .wrap(Wrap { trim: true }),
                inner,
            );
        }
        Body::Usage {
            rows,
            last_update,
            stale,
        } => {
            let mut constraints = vec![Constraint::Length(3); rows.len()];
            constraints.push(Constraint::Min(1));
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints(constraints)
                .split(inner);

            for (row, chunk) in rows.iter().zip(chunks.iter()) {
                let color = if row.title == "Opus Only" { COLOR_OPUS } else { COLOR_ACCENT };
                let parts = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([Constraint::Length(1), Constraint::Length(1), Constraint::Length(1)])
                    .split(*chunk);
                f.render_widget(
                    Paragraph::new(row.title).style(Style::default().add_modifier(Modifier::BOLD)),
                    parts[0],
                );
                f.render_widget(
                    Gauge::default()
                        .gauge_style(Style::default().fg(color))
                        .ratio(row.ratio())
                        .label(""),
                    parts[1],
                );
                f.render_widget(
                    Paragraph::new(Line::from(vec![
                        Span::styled(format!("{}%", row.percentage), Style::default().fg(color)),
                        Span::raw("  "),
                        Span::styled(row.reset_label.clone(), Style::default().fg(COLOR_MUTED)),
                    ])),
                    parts[2],
                );
            }

            let mut lines = vec![Line::from(Span::styled(
                format!("Last update: {last_update}"),
                Style::default().fg(COLOR_MUTED),
            ))];
            if *stale {
                lines.push(Line::from(Span::styled(
                    "Press r to load the latest data",
                    Style::default().fg(COLOR_WARN),
                )));
            }
            if let Some(chunk) = chunks.last() {
                f.render_widget(Paragraph::new(lines), *chunk);
            }
        }
    }
}
