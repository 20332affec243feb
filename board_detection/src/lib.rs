pub mod board_detection;
