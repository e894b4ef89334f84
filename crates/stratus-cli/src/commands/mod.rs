pub mod options;
pub mod prompt;
pub mod run;
