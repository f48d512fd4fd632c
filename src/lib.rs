pub mod errors;

pub mod data_structures {
    pub mod graph_structure;
}

pub mod factor_types {
    pub mod factor;
    pub mod factor_data;
    pub mod factor_type;
}

pub mod fg {
    pub mod data_generator;
    pub mod factor_graph;
    pub mod observation;
}

pub mod inference {
    pub mod map_inference;
    pub mod mplp;
    pub mod mplp_regions;
    pub mod tree_max_product;
}

pub mod model {
    pub mod factor_graph_model;
}

pub mod solvers {
    pub mod bmrm;
    pub mod fw_sosvm;
    pub mod qp_simplex;
    pub mod solver;
    pub mod sosvm_helper;
    pub mod stochastic_sosvm;
}
