#[cfg(feature = "browser")]
pub mod browser;
pub mod http_page;
pub mod image_source;
mod net;
pub mod report;

#[cfg(feature = "browser")]
pub use browser::{BrowserPage, BrowserPageProvider};
pub use http_page::{HttpPage, HttpPageProvider};
pub use image_source::ReqwestImageSource;
pub use report::MarkdownReportSink;
