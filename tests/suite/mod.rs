mod config;
#[cfg(unix)]
mod session;
