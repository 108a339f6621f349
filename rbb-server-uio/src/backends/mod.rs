pub mod axi_gpio;
