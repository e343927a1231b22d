pub mod analysis;
pub mod chunker;
pub mod extractor;
pub mod form_recognizer;
pub mod mail;
pub mod parser;

pub use analysis::{DocumentAnalyzer, PdfTextAnalyzer};
pub use chunker::TextChunker;
pub use extractor::{ContentExtractor, ExtractionStrategy, UploadedFile};
pub use form_recognizer::FormRecognizerClient;
