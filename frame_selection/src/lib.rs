pub mod frame_selection;
