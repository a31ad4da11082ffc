mod http;
mod multi_period;
mod retry;
