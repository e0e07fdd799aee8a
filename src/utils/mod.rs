pub mod http;
pub mod imaging;
pub mod logging;
pub mod timing;
