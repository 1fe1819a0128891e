#![cfg_attr(
    all(not(debug_assertions), target_os = "windows"),
    windows_subsystem = "windows"
)]

mod core;
mod inference;
mod models;

use core::{app_state::AppState, settings::FrontendSettings};

use inference::SessionInfo;
use models::ModelState;
use tauri::{AppHandle, Manager, RunEvent};
use tracing::metadata::LevelFilter;
use uuid::Uuid;

#[tauri::command]
async fn get_settings(state: tauri::State<'_, AppState>) -> tauri::Result<FrontendSettings> {
    Ok(state.settings_manager().read())
}

#[tauri::command]
async fn update_settings(
    state: tauri::State<'_, AppState>,
    settings: FrontendSettings,
) -> tauri::Result<()> {
    state
        .settings_manager()
        .write(settings)
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn list_models(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
) -> tauri::Result<Vec<ModelState>> {
    state.list_models(&app).map_err(tauri::Error::from)
}

#[tauri::command]
async fn get_model_state(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
    model_id: String,
) -> tauri::Result<ModelState> {
    state
        .model_state(&app, &model_id)
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn install_model(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
    model_id: String,
) -> tauri::Result<()> {
    state
        .install_model(&app, &model_id)
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn uninstall_model(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
    model_id: String,
) -> tauri::Result<()> {
    state
        .uninstall_model(&app, &model_id)
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn init_engine(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
    model_id: Option<String>,
    backend: Option<String>,
) -> tauri::Result<SessionInfo> {
    state
        .init_engine(&app, model_id.as_deref(), backend.as_deref())
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn release_engine(app: AppHandle, state: tauri::State<'_, AppState>) -> tauri::Result<()> {
    state.release_engine(&app);
    Ok(())
}

#[tauri::command]
async fn ask_question(
    app: AppHandle,
    state: tauri::State<'_, AppState>,
    image_path: String,
    prompt: String,
) -> tauri::Result<Uuid> {
    state
        .ask_question(&app, &image_path, &prompt)
        .map_err(tauri::Error::from)
}

#[tauri::command]
async fn stop_answer(state: tauri::State<'_, AppState>) -> tauri::Result<()> {
    state.stop_answer();
    Ok(())
}

#[cfg(debug_assertions)]
#[tauri::command]
async fn get_logs() -> Vec<String> {
    crate::core::logs::snapshot()
}

fn setup_logging() {
    let filter = std::env::var("LIFELENS_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    setup_logging();

    let app = tauri::Builder::default()
        .manage(AppState::new().expect("failed to initialize application state"))
        .invoke_handler(tauri::generate_handler![
            get_settings,
            update_settings,
            list_models,
            get_model_state,
            install_model,
            uninstall_model,
            init_engine,
            release_engine,
            ask_question,
            stop_answer,
            #[cfg(debug_assertions)]
            get_logs
        ])
        .setup(|app| {
            if let Some(state) = app.try_state::<AppState>() {
                let handle = app.handle().clone();
                state.initialize(&handle)?;
                #[cfg(debug_assertions)]
                crate::core::logs::initialize(&handle);
            }
            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| {
        if let RunEvent::Exit = event {
            if let Some(state) = app_handle.try_state::<AppState>() {
                state.shutdown();
            }
        }
    });
}
