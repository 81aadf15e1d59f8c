pub mod redraw;
