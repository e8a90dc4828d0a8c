mod webcam;
mod y4m_file;

pub use webcam::WebcamSource;
pub use y4m_file::Y4mFileSource;
