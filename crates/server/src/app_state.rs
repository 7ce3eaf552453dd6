use server_api::ModelSource;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) source: ModelSource,
    pub(crate) max_frame_bytes: usize,
}
