#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod health;
pub mod hub;
pub mod membership;
pub mod registry;
pub mod session;

use tokio::sync::watch;

/// Resolves once shutdown has been requested or the signal owner is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
	loop {
		if *rx.borrow_and_update() {
			return;
		}
		if rx.changed().await.is_err() {
			return;
		}
	}
}

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod hub_tests;




#[cfg(test)]
mod session_tests;
