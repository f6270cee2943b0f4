//! Errors reported while loading a forest or running a detection.

use image;
use serde_json;
use std::io;

error_chain! {
    foreign_links {
        Io(io::Error);
        Json(serde_json::Error);
        Image(image::ImageError);
    }

    errors {
        // Option values of the model file which do not fit together
        InvalidOptions(msg: String) {
            description("invalid forest options")
            display("Invalid forest options: {}", msg)
        }
        // Tree arrays with a wrong shape or references out of range
        MalformedForest(msg: String) {
            description("malformed forest")
            display("Malformed forest: {}", msg)
        }
        // An image which cannot be used as input for the detector
        InvalidInput(msg: String) {
            description("invalid input image")
            display("Invalid input: {}", msg)
        }
        ChannelMismatch(expected: usize, found: usize) {
            description("unexpected number of channels")
            display("Expected {} channels, found {}", expected, found)
        }
    }
}
