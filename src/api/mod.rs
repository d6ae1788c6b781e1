use crate::AppState;
use axum::Router;

mod home;
pub mod push;

pub fn routes() -> Router<AppState> {
	Router::new().merge(home::routes()).merge(push::routes())
}
